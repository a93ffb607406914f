//! Ingress classification and tunnel envelopes.
//!
//! The first request line of an inbound connection decides how it is
//! served: `CONNECT` opens a raw tunnel, `GET /pac` is answered locally and
//! anything else is replayed verbatim inside a reverse envelope. Only the
//! bytes of the request line are inspected before that decision; a reverse
//! session forwards the untouched stream.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderName, HeaderValue, Method, Request, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use burrow_core::endpoint::authority_with_port;

use super::error::SessionError;
use super::request_end::{Progress, RequestEndTracker};
use crate::tunnel::body::{TunnelBody, channel_body};

/// Largest CONNECT head read from the inbound connection.
pub const MAX_HEAD_BYTES: usize = 64 << 10;
const MAX_HEADERS: usize = 100;

/// Path of locally served PAC requests.
pub const PAC_PATH: &str = "/pac";
/// Path every reverse envelope is sent to.
pub const REVERSE_PATH: &str = "/r";

/// Headers that describe the inbound hop and are not forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "host",
];

/// `method SP request-target SP protocol`, split on the first two spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub proto: String,
}

pub fn parse_request_line(line: &str) -> Option<RequestLine> {
    let (method, rest) = line.split_once(' ')?;
    let (target, proto) = rest.split_once(' ')?;
    Some(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        proto: proto.to_string(),
    })
}

/// Read the first request line without consuming it.
pub async fn peek_request_line<R>(reader: &mut R) -> Result<String, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let buf = match reader.fill_buf().await {
        Ok(buf) if !buf.is_empty() => buf,
        Ok(_) => return Err(SessionError::NoRequest),
        Err(e) => return Err(SessionError::Relay(e)),
    };
    let end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(SessionError::BadRequest)?;
    let line = String::from_utf8_lossy(&buf[..end]);
    Ok(line.trim_end_matches('\r').to_string())
}

/// How an inbound session is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingress {
    /// Raw tunnel to `target` (`host:port`).
    Connect { target: String },
    /// Answer with the rendered PAC template.
    Pac,
    /// Replay the request to `target` inside a reverse envelope.
    Reverse { target: String },
}

/// Decide how to serve the connection whose first line is `line`.
/// `buffered` holds the peeked bytes, used to find `Host` for
/// origin-form request targets.
pub fn classify(
    line: &str,
    local_addr: SocketAddr,
    buffered: &[u8],
) -> Result<Ingress, SessionError> {
    let request = parse_request_line(line)
        .ok_or_else(|| SessionError::Malformed(format!("bad request line {line:?}")))?;

    if request.method == Method::CONNECT.as_str() {
        let uri: Uri = request
            .target
            .parse()
            .map_err(|e| SessionError::Malformed(format!("bad CONNECT target: {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| SessionError::Malformed("CONNECT target has no authority".into()))?;
        return Ok(Ingress::Connect {
            target: authority_with_port("", authority.as_str()),
        });
    }

    let uri: Uri = request
        .target
        .parse()
        .map_err(|e| SessionError::Malformed(format!("bad request target: {e}")))?;
    let host = uri.authority().map(|a| a.as_str().to_string());

    if uri.path() == PAC_PATH && request.method == Method::GET.as_str() {
        let local = local_addr.to_string();
        if host.as_deref().is_none_or(|h| h.is_empty() || h == local) {
            return Ok(Ingress::Pac);
        }
    }

    let authority = match host {
        Some(h) => h,
        None => host_header(buffered)
            .ok_or_else(|| SessionError::Malformed("request has no target host".into()))?,
    };
    Ok(Ingress::Reverse {
        target: authority_with_port(uri.scheme_str().unwrap_or(""), &authority),
    })
}

/// `Host` header value from whatever part of the head is buffered.
fn host_header(buffered: &[u8]) -> Option<String> {
    String::from_utf8_lossy(buffered)
        .lines()
        .skip(1)
        .take_while(|l| !l.trim().is_empty())
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .filter(|h| !h.is_empty())
}

/// Request head read from the inbound connection.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Consume a full request head (through the blank line) from `reader`.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let start = raw.len();
        let n = reader.read_until(b'\n', &mut raw).await?;
        if n == 0 {
            return Err(SessionError::Malformed(
                "connection closed inside request head".into(),
            ));
        }
        if raw.len() > MAX_HEAD_BYTES {
            return Err(SessionError::Malformed("request head too large".into()));
        }
        if start > 0 && matches!(&raw[start..], b"\r\n" | b"\n") {
            break;
        }
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(SessionError::Malformed("incomplete request head".into()));
        }
        Err(e) => return Err(SessionError::Malformed(e.to_string())),
    }

    Ok(RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    })
}

/// Builds requests addressed to the tunnel endpoint.
///
/// The URI always names the endpoint; the real target travels in `Host`.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    endpoint: String,
}

impl EnvelopeBuilder {
    /// `endpoint` is the endpoint authority (`host:port`).
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn uri(&self, path: &str) -> Result<Uri, SessionError> {
        format!("https://{}{path}", self.endpoint)
            .parse()
            .map_err(|e| SessionError::Malformed(format!("bad endpoint URI: {e}")))
    }

    /// CONNECT envelope: end-to-end headers of `head`, `Host` = `target`.
    pub fn connect(
        &self,
        head: &RequestHead,
        target: &str,
        body: TunnelBody,
    ) -> Result<Request<TunnelBody>, SessionError> {
        let mut req = Request::new(body);
        *req.method_mut() = Method::CONNECT;
        *req.uri_mut() = self.uri("/")?;

        for (name, value) in &head.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) else {
                continue;
            };
            req.headers_mut().append(name, value);
        }
        req.headers_mut().insert(HOST, host_value(target)?);
        Ok(req)
    }

    /// Reverse envelope: `POST /r` with `Host` = `target` and a streamed
    /// body of unknown length.
    pub fn reverse(&self, target: &str, body: TunnelBody) -> Result<Request<TunnelBody>, SessionError> {
        let mut req = Request::new(body);
        *req.method_mut() = Method::POST;
        *req.uri_mut() = self.uri(REVERSE_PATH)?;
        req.headers_mut().insert(HOST, host_value(target)?);
        Ok(req)
    }
}

fn host_value(target: &str) -> Result<HeaderValue, SessionError> {
    HeaderValue::from_str(target)
        .map_err(|_| SessionError::Malformed(format!("bad target authority {target:?}")))
}

/// Chunks queued between the tee task and the envelope body.
const TEE_DEPTH: usize = 8;

/// Body that replays the raw inbound request from `reader`.
///
/// A companion task forwards bytes as they arrive and stops exactly at
/// the end of the embedded request. Premature EOF or unparsable framing
/// aborts the body with an error. The task also stops when `cancel` fires.
pub fn request_tee<R>(mut reader: R, cancel: CancellationToken) -> TunnelBody
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(TEE_DEPTH);
    tokio::spawn(async move {
        let mut tracker = RequestEndTracker::new();
        loop {
            let chunk = tokio::select! {
                res = reader.fill_buf() => res,
                () = cancel.cancelled() => return,
            };
            let (data, done) = match chunk {
                Ok([]) => {
                    let _ = tx
                        .send(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "inbound closed before request end",
                        )))
                        .await;
                    return;
                }
                Ok(buf) => match tracker.feed(buf) {
                    Ok(Progress::NeedMore) => (Bytes::copy_from_slice(buf), false),
                    Ok(Progress::Done { consumed }) => {
                        (Bytes::copy_from_slice(&buf[..consumed]), true)
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(io::Error::new(io::ErrorKind::InvalidData, e)))
                            .await;
                        return;
                    }
                },
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            reader.consume(data.len());
            if tx.send(Ok(data)).await.is_err() || done {
                return;
            }
        }
    });
    channel_body(rx)
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;

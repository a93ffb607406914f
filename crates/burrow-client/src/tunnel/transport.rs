//! Multiplexed HTTP/2 transport over physical tunnel connections.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use http::header::HOST;
use http::uri::PathAndQuery;
use http::{Method, Request, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use super::body::{TunnelBody, TunnelResponse, empty_body, incoming_reader};
use super::capability::CapabilityCache;
use super::dialer::{TunnelDialer, TunnelStream};
use super::error::TransportError;
use super::keepalive;

/// Sends one request over the tunnel and returns its response.
pub trait RoundTrip: Send + Sync {
    fn round_trip(
        &self,
        req: Request<TunnelBody>,
    ) -> impl Future<Output = Result<TunnelResponse, TransportError>> + Send;
}

/// A connection the keepalive monitor can watch and close.
pub trait MonitoredConnection: RoundTrip {
    fn id(&self) -> u64;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Resolves once the connection is closed for any reason.
    fn closed(&self) -> WaitForCancellationFuture<'_>;
}

/// One secured HTTP/2 connection to the endpoint.
pub struct PhysicalConnection {
    id: u64,
    sender: http2::SendRequest<TunnelBody>,
    closer: CancellationToken,
}

impl PhysicalConnection {
    /// Run the HTTP/2 client handshake over `io` and spawn the connection
    /// driver. The driver stops on [`close`](MonitoredConnection::close).
    pub async fn establish(id: u64, io: TunnelStream) -> Result<Self, TransportError> {
        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
        let closer = CancellationToken::new();

        let token = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = conn => {
                    if let Err(e) = res {
                        debug!(conn_id = id, error = %e, "Tunnel connection driver failed");
                    }
                }
                () = token.cancelled() => {}
            }
            token.cancel();
            info!(conn_id = id, "Tunnel connection closed");
        });

        Ok(Self { id, sender, closer })
    }

    pub fn is_open(&self) -> bool {
        !self.closer.is_cancelled() && !self.sender.is_closed()
    }
}

impl RoundTrip for PhysicalConnection {
    async fn round_trip(&self, req: Request<TunnelBody>) -> Result<TunnelResponse, TransportError> {
        let mut sender = self.sender.clone();
        sender.ready().await?;

        let req = to_wire(req)?;
        if req.method() == Method::CONNECT {
            return send_connect(sender, req).await;
        }

        let resp = sender.send_request(req).await?;
        let (parts, body) = resp.into_parts();
        Ok(TunnelResponse {
            status: parts.status,
            headers: parts.headers,
            body: incoming_reader(body),
        })
    }
}

impl MonitoredConnection for PhysicalConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn close(&self) {
        self.closer.cancel();
    }

    fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }
}

/// Move the `Host` header into the URI authority, which HTTP/2 sends as
/// `:authority`. CONNECT requests carry the authority alone.
fn to_wire(mut req: Request<TunnelBody>) -> Result<Request<TunnelBody>, TransportError> {
    let authority = match req.headers_mut().remove(HOST) {
        Some(host) => host
            .to_str()
            .map_err(|e| TransportError::Request(format!("bad Host header: {e}")))?
            .to_string(),
        None => req
            .uri()
            .authority()
            .map(ToString::to_string)
            .ok_or_else(|| TransportError::Request("request has no authority".into()))?,
    };

    let uri = if req.method() == Method::CONNECT {
        Uri::builder().authority(authority).build()
    } else {
        let path = req
            .uri()
            .path_and_query()
            .map_or("/", PathAndQuery::as_str)
            .to_string();
        Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path)
            .build()
    }
    .map_err(|e| TransportError::Request(e.to_string()))?;

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_2;
    Ok(req)
}

/// Send an HTTP/2 CONNECT. The request body is pumped into the upgraded
/// stream and the stream's read half becomes the response body.
async fn send_connect(
    mut sender: http2::SendRequest<TunnelBody>,
    req: Request<TunnelBody>,
) -> Result<TunnelResponse, TransportError> {
    let (parts, mut body) = req.into_parts();
    let mut resp = sender
        .send_request(Request::from_parts(parts, empty_body()))
        .await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    if status != StatusCode::OK {
        return Ok(TunnelResponse {
            status,
            headers,
            body: incoming_reader(resp.into_body()),
        });
    }

    let upgraded = hyper::upgrade::on(&mut resp).await?;
    let (read_half, mut write_half) = tokio::io::split(TokioIo::new(upgraded));

    tokio::spawn(async move {
        while let Some(frame) = body.frame().await {
            let data = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(_) => continue,
                },
                Err(e) => {
                    debug!(error = %e, "CONNECT request body failed");
                    break;
                }
            };
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    Ok(TunnelResponse {
        status,
        headers,
        body: Box::pin(read_half),
    })
}

/// Round-trips requests over the current physical connection, dialing a
/// new one when there is none or it has closed.
pub struct MuxTransport<D> {
    dialer: D,
    capabilities: Arc<CapabilityCache>,
    current: Mutex<Option<Arc<PhysicalConnection>>>,
    next_id: AtomicU64,
    established: AtomicU64,
}

impl<D: TunnelDialer> MuxTransport<D> {
    pub fn new(dialer: D, capabilities: Arc<CapabilityCache>) -> Self {
        Self {
            dialer,
            capabilities,
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            established: AtomicU64::new(0),
        }
    }

    /// Number of physical connections established so far.
    pub fn connections_established(&self) -> u64 {
        self.established.load(Ordering::Relaxed)
    }

    /// Current live connection, dialing one when needed. Dials are
    /// serialised.
    pub async fn connection(&self) -> Result<Arc<PhysicalConnection>, TransportError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(conn));
        }
        if let Some(stale) = current.take() {
            stale.close();
        }

        let conn = self.dial_new().await?;
        *current = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn dial_new(&self) -> Result<Arc<PhysicalConnection>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.dialer.dial().await.inspect_err(|e| {
            warn!(conn_id = id, phase = %e.phase, error = %e.message, "Tunnel dial failed");
        })?;

        let conn = Arc::new(PhysicalConnection::establish(id, stream).await?);
        self.established.fetch_add(1, Ordering::Relaxed);
        info!(conn_id = id, "Tunnel connection established");

        keepalive::spawn_monitor(Arc::clone(&conn), Arc::clone(&self.capabilities));
        Ok(conn)
    }
}

impl<D: TunnelDialer> RoundTrip for MuxTransport<D> {
    async fn round_trip(&self, req: Request<TunnelBody>) -> Result<TunnelResponse, TransportError> {
        let conn = self.connection().await?;
        conn.round_trip(req).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn request(method: Method, uri: &str, host: Option<&'static str>) -> Request<TunnelBody> {
        let mut req = Request::new(empty_body());
        *req.method_mut() = method;
        *req.uri_mut() = uri.parse().unwrap();
        if let Some(host) = host {
            req.headers_mut().insert(HOST, HeaderValue::from_static(host));
        }
        req
    }

    #[test]
    fn host_header_becomes_authority() {
        let req = request(
            Method::POST,
            "https://tunnel.example.com/r",
            Some("example.org:80"),
        );
        let wire = to_wire(req).unwrap();
        assert_eq!(wire.uri().to_string(), "https://example.org:80/r");
        assert!(wire.headers().get(HOST).is_none());
        assert_eq!(wire.version(), Version::HTTP_2);
    }

    #[test]
    fn connect_uses_authority_form() {
        let req = request(
            Method::CONNECT,
            "https://tunnel.example.com/",
            Some("example.org:443"),
        );
        let wire = to_wire(req).unwrap();
        assert_eq!(wire.uri().authority().unwrap().as_str(), "example.org:443");
        assert!(wire.uri().scheme().is_none());
    }

    #[test]
    fn control_host_is_kept_verbatim() {
        let wire = to_wire(request(Method::HEAD, "/", Some("i:80"))).unwrap();
        assert_eq!(wire.uri().to_string(), "https://i:80/");
    }

    #[test]
    fn request_without_authority_is_rejected() {
        assert!(matches!(
            to_wire(request(Method::GET, "/", None)),
            Err(TransportError::Request(_))
        ));
    }
}

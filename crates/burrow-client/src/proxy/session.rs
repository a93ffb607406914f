//! Inbound proxy session handling.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::ingress::{self, EnvelopeBuilder, Ingress};
use super::listener::ConnectionHandler;
use super::pac::PacCache;
use crate::tunnel::RoundTrip;
use crate::tunnel::body::reader_body;

/// Reply when the tunnel request itself fails.
pub const BAD_GATEWAY_REPLY: &[u8] = b"HTTP/1.1 502 That's no street, Pete\r\n\r\n";
/// Reply preceding relayed bytes of a CONNECT tunnel.
pub const CONNECT_ESTABLISHED_REPLY: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

fn upstream_status_reply(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} Server failed to proxy\r\n\r\n",
        status.as_u16()
    )
}

/// How a session that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    PacServed,
    /// CONNECT tunnel closed after relaying `bytes` to the client.
    Connect { bytes: u64 },
    /// Reverse response relayed (`bytes` long).
    Reverse { bytes: u64 },
}

/// Serves inbound connections over a [`RoundTrip`] transport.
pub struct ProxySessionHandler<R> {
    transport: Arc<R>,
    envelopes: EnvelopeBuilder,
    pac: Arc<PacCache>,
    buf_size: usize,
}

impl<R: RoundTrip + 'static> ProxySessionHandler<R> {
    pub const fn new(
        transport: Arc<R>,
        envelopes: EnvelopeBuilder,
        pac: Arc<PacCache>,
        buf_size: usize,
    ) -> Self {
        Self {
            transport,
            envelopes,
            pac,
            buf_size,
        }
    }

    /// Serve one inbound connection accepted on `local_addr`.
    ///
    /// The connection is shut down exactly once, on every return path.
    /// Bodies still streaming from it stop when this returns.
    pub async fn serve<IO>(&self, io: IO, local_addr: SocketAddr) -> Result<SessionOutcome, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let cancel = CancellationToken::new();
        let _stop_bodies = cancel.clone().drop_guard();

        let (read_half, mut write_half) = tokio::io::split(io);
        let result = self
            .drive(read_half, &mut write_half, local_addr, cancel)
            .await;
        if let Err(e) = write_half.shutdown().await {
            debug!(error = %e, "Inbound shutdown failed");
        }
        result
    }

    async fn drive<RD, W>(
        &self,
        read_half: RD,
        write_half: &mut W,
        local_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<SessionOutcome, SessionError>
    where
        RD: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::with_capacity(self.buf_size, read_half);
        let line = ingress::peek_request_line(&mut reader).await?;
        let ingress = ingress::classify(&line, local_addr, reader.buffer())?;
        debug!(request_line = %line, ?ingress, "Classified inbound request");

        let (request, is_connect) = match ingress {
            Ingress::Pac => {
                let rendered = self
                    .pac
                    .render(&local_addr.to_string())
                    .await
                    .ok_or(SessionError::PacUnavailable)?;
                write_half.write_all(rendered.as_bytes()).await?;
                return Ok(SessionOutcome::PacServed);
            }
            Ingress::Connect { target } => {
                let head = ingress::read_request_head(&mut reader).await?;
                let body = reader_body(
                    StopOnCancel::new(reader, cancel),
                    self.buf_size,
                );
                (self.envelopes.connect(&head, &target, body)?, true)
            }
            Ingress::Reverse { target } => {
                let body = ingress::request_tee(reader, cancel);
                (self.envelopes.reverse(&target, body)?, false)
            }
        };

        let mut response = match self.transport.round_trip(request).await {
            Ok(response) => response,
            Err(e) => {
                write_half.write_all(BAD_GATEWAY_REPLY).await?;
                return Err(SessionError::Upstream(e));
            }
        };
        if response.status != StatusCode::OK {
            write_half
                .write_all(upstream_status_reply(response.status).as_bytes())
                .await?;
            return Err(SessionError::UpstreamStatus(response.status.as_u16()));
        }

        if is_connect {
            write_half.write_all(CONNECT_ESTABLISHED_REPLY).await?;
        }
        let bytes = tokio::io::copy(&mut response.body, write_half).await?;
        Ok(if is_connect {
            SessionOutcome::Connect { bytes }
        } else {
            SessionOutcome::Reverse { bytes }
        })
    }
}

impl<R: RoundTrip + 'static> ConnectionHandler<TcpStream> for ProxySessionHandler<R> {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%peer, error = %e, "Inbound connection has no local address");
                return;
            }
        };
        match self.serve(stream, local_addr).await {
            Ok(outcome) => debug!(%peer, ?outcome, "Session finished"),
            Err(e) if e.is_client_error() => debug!(%peer, error = %e, "Rejected inbound request"),
            Err(e) => info!(%peer, error = %e, "Session failed"),
        }
    }
}

/// Reader that reports EOF once `cancel` fires.
struct StopOnCancel<R> {
    inner: R,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    stopped: bool,
}

impl<R> StopOnCancel<R> {
    fn new(inner: R, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
            stopped: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for StopOnCancel<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.stopped || this.cancelled.as_mut().poll(cx).is_ready() {
            this.stopped = true;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;

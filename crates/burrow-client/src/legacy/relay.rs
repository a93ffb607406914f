//! Full-duplex relay between an inbound connection and one pooled pipe.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use super::pool::{ConnectionPool, MessageConn, PipeDialer};
use crate::proxy::ConnectionHandler;
use crate::tunnel::keepalive::ping_ticker;

/// Which side ended a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    InboundClosed,
    TunnelClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Tunnel write failed: {0}")]
    Tunnel(#[from] WsError),

    #[error("Inbound write failed: {0}")]
    Inbound(#[from] io::Error),
}

/// Chunks from one side; `None` marks EOF.
type Chunks = mpsc::Receiver<Option<Bytes>>;

fn read_inbound<R>(mut reader: R, buf_size: usize) -> (Chunks, AbortOnDropHandle<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; buf_size];
        loop {
            let chunk = match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => Some(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    debug!(error = %e, "Inbound read failed");
                    None
                }
            };
            let eof = chunk.is_none();
            if tx.send(chunk).await.is_err() || eof {
                return;
            }
        }
    });
    (rx, AbortOnDropHandle::new(task))
}

fn read_tunnel<S>(mut stream: S) -> (Chunks, AbortOnDropHandle<()>)
where
    S: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(async move {
        loop {
            let chunk = match stream.next().await {
                Some(Ok(Message::Binary(data))) => Some(data),
                Some(Ok(Message::Text(text))) => Some(Bytes::copy_from_slice(text.as_bytes())),
                Some(Ok(Message::Close(_))) | None => None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "Tunnel read failed");
                    None
                }
            };
            let eof = chunk.is_none();
            if tx.send(chunk).await.is_err() || eof {
                return;
            }
        }
    });
    (rx, AbortOnDropHandle::new(task))
}

/// Relay until either side reaches EOF or a write fails. A ping is sent
/// over the pipe every `ping_period`. Both sides are closed on return.
pub async fn relay<IO, C>(
    inbound: IO,
    pipe: C,
    buf_size: usize,
    ping_period: Duration,
) -> Result<RelayEnd, RelayError>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    C: MessageConn,
{
    let (inbound_read, mut inbound_write) = tokio::io::split(inbound);
    let (mut sink, stream) = pipe.split();
    let (mut from_inbound, _inbound_task) = read_inbound(inbound_read, buf_size);
    let (mut from_tunnel, _tunnel_task) = read_tunnel(stream);

    let mut ping = ping_ticker(ping_period);

    let result = loop {
        tokio::select! {
            chunk = from_inbound.recv() => match chunk.flatten() {
                Some(data) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        break Err(RelayError::Tunnel(e));
                    }
                }
                None => break Ok(RelayEnd::InboundClosed),
            },
            chunk = from_tunnel.recv() => match chunk.flatten() {
                Some(data) => {
                    if let Err(e) = inbound_write.write_all(&data).await {
                        break Err(RelayError::Inbound(e));
                    }
                }
                None => break Ok(RelayEnd::TunnelClosed),
            },
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    break Err(RelayError::Tunnel(e));
                }
            }
        }
    };

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Pipe close failed");
    }
    if let Err(e) = inbound_write.shutdown().await {
        debug!(error = %e, "Inbound shutdown failed");
    }
    result
}

/// Serves each inbound connection over its own pooled pipe.
pub struct PooledRelay<D: PipeDialer> {
    pool: Arc<ConnectionPool<D>>,
    buf_size: usize,
    ping_period: Duration,
}

impl<D: PipeDialer> PooledRelay<D> {
    pub const fn new(pool: Arc<ConnectionPool<D>>, buf_size: usize, ping_period: Duration) -> Self {
        Self {
            pool,
            buf_size,
            ping_period,
        }
    }
}

impl<D: PipeDialer> ConnectionHandler<TcpStream> for PooledRelay<D> {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let (slot, pipe) = match self.pool.claim().await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(%peer, error = %e, "No pooled pipe for inbound connection");
                return;
            }
        };
        debug!(%peer, slot = slot.index(), "Relaying over pooled pipe");

        match relay(stream, pipe, self.buf_size, self.ping_period).await {
            Ok(end) => debug!(%peer, slot = slot.index(), ?end, "Relay finished"),
            Err(e) => info!(%peer, slot = slot.index(), error = %e, "Relay failed"),
        }
    }
}

#[cfg(test)]
#[path = "relay_tests.rs"]
mod tests;

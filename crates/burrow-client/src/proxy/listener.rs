//! Accept loop for local proxy ports.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Source of inbound connections.
pub trait Acceptor: Send {
    type Conn: Send + 'static;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Conn, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        Self::accept(self).await
    }
}

/// Serves one accepted connection to completion.
pub trait ConnectionHandler<C>: Send + Sync + 'static {
    fn handle(&self, conn: C, peer: SocketAddr) -> impl Future<Output = ()> + Send;
}

/// Delay between retries of transient accept failures.
#[derive(Debug, Default)]
pub struct AcceptBackoff {
    current: Option<Duration>,
}

impl AcceptBackoff {
    pub const INITIAL: Duration = Duration::from_millis(5);
    pub const MAX: Duration = Duration::from_secs(1);

    /// Delay before the next retry: 5ms, doubling, capped at 1s.
    pub fn next_delay(&mut self) -> Duration {
        let next = self
            .current
            .map_or(Self::INITIAL, |d| (d * 2).min(Self::MAX));
        self.current = Some(next);
        next
    }

    pub const fn reset(&mut self) {
        self.current = None;
    }
}

/// Accept errors worth retrying.
pub fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Accept connections until shutdown or a non-transient error, spawning
/// one task per connection. Session panics are caught and logged.
pub async fn serve<A, H>(
    mut acceptor: A,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    A: Acceptor,
    H: ConnectionHandler<A::Conn>,
{
    let mut backoff = AcceptBackoff::default();
    loop {
        let accepted = tokio::select! {
            res = acceptor.accept() => res,
            _ = shutdown.changed() => {
                info!("Listener shutting down");
                return Ok(());
            }
        };

        let (conn, peer) = match accepted {
            Ok(accepted) => {
                backoff.reset();
                accepted
            }
            Err(e) if is_transient(&e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, ?delay, "Accept failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                return Err(e);
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let session = AssertUnwindSafe(handler.handle(conn, peer)).catch_unwind();
            if let Err(panic) = session.await {
                error!(%peer, panic = panic_message(panic.as_ref()), "Session panicked");
            }
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;

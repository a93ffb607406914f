//! Fixed-size pool of WebSocket pipes to the endpoint.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use futures_util::{Sink, Stream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use burrow_core::PoolAffinity;

use crate::tunnel::DialError;
use crate::tunnel::dialer::{WsConnection, WsConnector};

/// Message-framed duplex connection.
pub trait MessageConn:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static
{
}

impl<T> MessageConn for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Send
        + Unpin
        + 'static
{
}

/// Opens new pipes for the pool.
pub trait PipeDialer: Send + Sync + 'static {
    type Conn: MessageConn;

    fn open(&self) -> impl Future<Output = Result<Self::Conn, DialError>> + Send;
}

/// Pipes opened as WebSockets on the endpoint's pipe path.
pub struct WsPipeDialer {
    ws: WsConnector,
    url: String,
}

impl WsPipeDialer {
    pub const fn new(ws: WsConnector, url: String) -> Self {
        Self { ws, url }
    }
}

impl PipeDialer for WsPipeDialer {
    type Conn = WsConnection;

    async fn open(&self) -> Result<WsConnection, DialError> {
        self.ws.open(&self.url).await
    }
}

struct Slot<C> {
    busy: AtomicBool,
    warm: Mutex<Option<C>>,
}

impl<C> Slot<C> {
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn take_warm(&self) -> Option<C> {
        self.warm.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Pool of `size` slots, each held by at most one session at a time.
///
/// Idle slots keep a pre-opened pipe so a claim rarely waits on a dial.
pub struct ConnectionPool<D: PipeDialer> {
    dialer: D,
    slots: Vec<Slot<D::Conn>>,
    affinity: PoolAffinity,
    next: Mutex<usize>,
    available: Arc<Semaphore>,
}

impl<D: PipeDialer> ConnectionPool<D> {
    pub fn new(dialer: D, size: usize, affinity: PoolAffinity) -> Arc<Self> {
        let slots = (0..size)
            .map(|_| Slot {
                busy: AtomicBool::new(false),
                warm: Mutex::new(None),
            })
            .collect();
        Arc::new(Self {
            dialer,
            slots,
            affinity,
            next: Mutex::new(0),
            available: Arc::new(Semaphore::new(size)),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Open a pipe for every empty slot.
    pub async fn warm_up(&self) {
        join_all((0..self.slots.len()).map(|i| self.rewarm(i))).await;
    }

    /// Claim a free slot, waiting for one when all are busy. The pipe is
    /// the slot's warm one, or a freshly dialled one.
    pub async fn claim(self: &Arc<Self>) -> Result<(SlotGuard<D>, D::Conn), DialError> {
        let permit = Arc::clone(&self.available)
            .acquire_owned()
            .await
            .map_err(|_| DialError::connect("connection pool closed"))?;
        let index = self
            .pick_slot()
            .ok_or_else(|| DialError::connect("no free pool slot"))?;
        let guard = SlotGuard {
            pool: Arc::clone(self),
            index,
            _permit: permit,
        };

        let conn = match self.slots[index].take_warm() {
            Some(conn) => conn,
            None => self.dialer.open().await?,
        };
        Ok((guard, conn))
    }

    fn pick_slot(&self) -> Option<usize> {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }
        let start = match self.affinity {
            PoolAffinity::RoundRobin => {
                let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
                let start = *next;
                *next = (start + 1) % n;
                start
            }
            PoolAffinity::FirstFree => 0,
        };
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| self.slots[i].try_claim())
    }

    async fn rewarm(&self, index: usize) {
        let slot = &self.slots[index];
        if slot.warm.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return;
        }
        match self.dialer.open().await {
            Ok(conn) => {
                let mut warm = slot.warm.lock().unwrap_or_else(PoisonError::into_inner);
                if warm.is_none() {
                    *warm = Some(conn);
                    debug!(slot = index, "Pool slot warmed");
                }
            }
            Err(e) => warn!(slot = index, error = %e, "Failed to warm pool slot"),
        }
    }
}

/// Holds a claimed slot. Dropping it frees the slot and re-warms it in
/// the background.
pub struct SlotGuard<D: PipeDialer> {
    pool: Arc<ConnectionPool<D>>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl<D: PipeDialer> SlotGuard<D> {
    pub const fn index(&self) -> usize {
        self.index
    }
}

impl<D: PipeDialer> Drop for SlotGuard<D> {
    fn drop(&mut self) {
        self.pool.slots[self.index].busy.store(false, Ordering::Release);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            let index = self.index;
            runtime.spawn(async move { pool.rewarm(index).await });
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;

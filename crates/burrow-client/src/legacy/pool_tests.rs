#![allow(clippy::unwrap_used)]

use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::task::{Context, Poll};
use std::time::Duration;

use super::*;

/// Pipe that never yields messages and accepts every send.
struct FakePipe {
    id: usize,
}

impl Stream for FakePipe {
    type Item = Result<Message, WsError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(None)
    }
}

impl Sink<Message> for FakePipe {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), WsError> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct CountingDialer {
    opened: AtomicUsize,
    fail: AtomicBool,
}

impl PipeDialer for CountingDialer {
    type Conn = FakePipe;

    async fn open(&self) -> Result<FakePipe, DialError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DialError::connect("endpoint down"));
        }
        Ok(FakePipe {
            id: self.opened.fetch_add(1, Ordering::SeqCst),
        })
    }
}

#[tokio::test]
async fn round_robin_rotates_start_slot() {
    let pool = ConnectionPool::new(CountingDialer::default(), 3, PoolAffinity::RoundRobin);

    let mut order = Vec::new();
    for _ in 0..4 {
        let (slot, _conn) = pool.claim().await.unwrap();
        order.push(slot.index());
    }
    assert_eq!(order, vec![0, 1, 2, 0]);
}

#[tokio::test]
async fn first_free_prefers_lowest_slot() {
    let pool = ConnectionPool::new(CountingDialer::default(), 3, PoolAffinity::FirstFree);

    let (a, _) = pool.claim().await.unwrap();
    let (b, _) = pool.claim().await.unwrap();
    assert_eq!((a.index(), b.index()), (0, 1));

    drop(a);
    let (c, _) = pool.claim().await.unwrap();
    assert_eq!(c.index(), 0);
}

#[tokio::test]
async fn claims_wait_for_a_free_slot() {
    let pool = ConnectionPool::new(CountingDialer::default(), 1, PoolAffinity::RoundRobin);
    let (held, _conn) = pool.claim().await.unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.claim().await.map(|(slot, _)| slot.index()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn warm_pipes_are_reused() {
    let pool = ConnectionPool::new(CountingDialer::default(), 2, PoolAffinity::FirstFree);
    pool.warm_up().await;
    assert_eq!(pool.dialer.opened.load(Ordering::SeqCst), 2);

    let (_slot, conn) = pool.claim().await.unwrap();
    assert!(conn.id < 2);
    assert_eq!(pool.dialer.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_dial_releases_slot() {
    let pool = ConnectionPool::new(CountingDialer::default(), 1, PoolAffinity::FirstFree);
    pool.dialer.fail.store(true, Ordering::SeqCst);
    assert!(pool.claim().await.is_err());

    pool.dialer.fail.store(false, Ordering::SeqCst);
    let (slot, _) = pool.claim().await.unwrap();
    assert_eq!(slot.index(), 0);
}

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use super::*;

/// Acceptor replaying a script, then waiting forever.
struct ScriptedAcceptor {
    script: VecDeque<io::Result<u32>>,
}

impl ScriptedAcceptor {
    fn new(script: Vec<io::Result<u32>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Acceptor for ScriptedAcceptor {
    type Conn = u32;

    async fn accept(&mut self) -> io::Result<(u32, SocketAddr)> {
        match self.script.pop_front() {
            Some(res) => res.map(|conn| (conn, "127.0.0.1:5555".parse().unwrap())),
            None => std::future::pending().await,
        }
    }
}

/// Counts sessions; connection `0` panics.
#[derive(Default)]
struct CountingHandler {
    handled: AtomicUsize,
    done: Notify,
}

impl ConnectionHandler<u32> for CountingHandler {
    async fn handle(&self, conn: u32, _peer: SocketAddr) {
        assert!(conn != 0, "session {conn} blew up");
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.done.notify_one();
    }
}

fn os_error(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[test]
fn backoff_doubles_to_cap_and_resets() {
    let mut backoff = AcceptBackoff::default();
    let delays: Vec<_> = (0..10).map(|_| backoff.next_delay()).collect();
    assert_eq!(delays[0], Duration::from_millis(5));
    assert_eq!(delays[1], Duration::from_millis(10));
    assert_eq!(delays[2], Duration::from_millis(20));
    assert_eq!(delays[8], Duration::from_secs(1));
    assert_eq!(delays[9], Duration::from_secs(1));

    backoff.reset();
    assert_eq!(backoff.next_delay(), AcceptBackoff::INITIAL);
}

#[test]
fn transient_errors_are_classified() {
    assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
    assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
    assert!(is_transient(&os_error(libc::EMFILE)));
    assert!(is_transient(&os_error(libc::ENFILE)));
    assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    assert!(!is_transient(&os_error(libc::EBADF)));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let acceptor = ScriptedAcceptor::new(vec![
        Err(os_error(libc::EMFILE)),
        Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        Ok(1),
        Ok(2),
    ]);
    let handler = Arc::new(CountingHandler::default());
    let (tx, rx) = watch::channel(false);

    let task = tokio::spawn(serve(acceptor, Arc::clone(&handler), rx));
    while handler.handled.load(Ordering::SeqCst) < 2 {
        handler.done.notified().await;
    }
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn fatal_error_ends_loop() {
    let acceptor = ScriptedAcceptor::new(vec![Err(os_error(libc::EBADF))]);
    let handler = Arc::new(CountingHandler::default());
    let (_tx, rx) = watch::channel(false);

    let err = serve(acceptor, handler, rx).await.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[tokio::test]
async fn panicking_session_does_not_stop_listener() {
    let acceptor = ScriptedAcceptor::new(vec![Ok(0), Ok(3)]);
    let handler = Arc::new(CountingHandler::default());
    let (tx, rx) = watch::channel(false);

    let task = tokio::spawn(serve(acceptor, Arc::clone(&handler), rx));
    handler.done.notified().await;
    assert_eq!(handler.handled.load(Ordering::SeqCst), 1);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

//! Byte-stream view of a WebSocket connection.
//!
//! [`MessageStream`] turns a message-framed connection into an
//! `AsyncRead + AsyncWrite` stream so a TLS session can run on top of it.
//! Each `poll_write` becomes one binary message; reads drain the current
//! inbound message and keep the remainder for the next call. A close frame
//! or the end of the message stream reads as EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::keepalive::ping_ticker;

pub struct MessageStream<S> {
    inner: S,
    pending: Bytes,
    eof: bool,
    ping: Option<Interval>,
    ping_due: bool,
}

impl<S> MessageStream<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
            ping: None,
            ping_due: false,
        }
    }

    /// Send a ping frame every `period` while the stream is being read.
    #[must_use]
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping = Some(ping_ticker(period));
        self
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_keepalive(&mut self, cx: &mut Context<'_>) {
        if let Some(ticker) = self.ping.as_mut() {
            while ticker.poll_tick(cx).is_ready() {
                self.ping_due = true;
            }
        }
        if !self.ping_due {
            return;
        }
        if let Poll::Ready(Ok(())) = Pin::new(&mut self.inner).poll_ready(cx) {
            if Pin::new(&mut self.inner)
                .start_send(Message::Ping(Bytes::new()))
                .is_ok()
            {
                // Progress is driven by the next flush; readiness is irrelevant here.
                let _ = Pin::new(&mut self.inner).poll_flush(cx);
            }
            self.ping_due = false;
        }
    }
}

impl<S> AsyncRead for MessageStream<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_keepalive(cx);

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(Message::Text(text))) => {
                    this.pending = Bytes::copy_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Close(_)))
                | None
                | Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    this.eof = true;
                }
                // Ping, pong and raw frames carry no payload for the reader.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl<S> AsyncWrite for MessageStream<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(io::Error::other(e))),
        }
    }
}

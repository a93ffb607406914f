//! Request and response bodies carried over the tunnel.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};

/// Body of an outbound tunnel request.
pub type TunnelBody = UnsyncBoxBody<Bytes, io::Error>;

/// Response body as a plain byte stream.
pub type ResponseBody = Pin<Box<dyn AsyncRead + Send>>;

pub fn empty_body() -> TunnelBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Stream everything `reader` yields, in chunks of at most `capacity`.
pub fn reader_body<R>(reader: R, capacity: usize) -> TunnelBody
where
    R: AsyncRead + Send + 'static,
{
    StreamBody::new(ReaderStream::with_capacity(reader, capacity).map_ok(Frame::data))
        .boxed_unsync()
}

/// Body fed by a channel; the body ends when every sender is dropped and
/// an `Err` item aborts it.
pub fn channel_body(rx: mpsc::Receiver<io::Result<Bytes>>) -> TunnelBody {
    StreamBody::new(ReceiverStream::new(rx).map_ok(Frame::data)).boxed_unsync()
}

pub(crate) fn incoming_reader(body: Incoming) -> ResponseBody {
    Box::pin(StreamReader::new(
        body.into_data_stream().map_err(io::Error::other),
    ))
}

/// Response received over the tunnel.
pub struct TunnelResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl TunnelResponse {
    pub fn new(status: StatusCode, body: impl AsyncRead + Send + 'static) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(body),
        }
    }

    /// Response without a body.
    pub fn status_only(status: StatusCode) -> Self {
        Self::new(status, tokio::io::empty())
    }

    /// Read the whole body into memory.
    pub async fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl std::fmt::Debug for TunnelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

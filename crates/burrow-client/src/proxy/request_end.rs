//! Incremental detection of where an HTTP/1.x request ends.
//!
//! Reverse sessions forward the raw inbound bytes as they arrive; the
//! tracker is fed the same bytes and reports the offset at which the
//! request (head plus `Content-Length` or chunked body, trailers included)
//! is complete.

/// Largest request head or chunk-size line accepted.
const MAX_HEAD_BYTES: usize = 64 << 10;
const MAX_LINE_BYTES: usize = 4 << 10;
const MAX_HEADERS: usize = 100;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("request head too large")]
    HeadTooLarge,

    #[error("malformed request head: {0}")]
    Head(String),

    #[error("invalid Content-Length")]
    ContentLength,

    #[error("malformed chunked body")]
    Chunked,

    #[error("data after end of request")]
    Finished,
}

/// Result of feeding a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Every fed byte belongs to the request; more are expected.
    NeedMore,
    /// The request ended after `consumed` bytes of the last chunk.
    Done { consumed: usize },
}

#[derive(Debug)]
enum State {
    Head(Vec<u8>),
    Fixed(u64),
    ChunkSize(Vec<u8>),
    ChunkData(u64),
    ChunkDataEnd,
    Trailer(Vec<u8>),
    Done,
}

#[derive(Debug)]
pub struct RequestEndTracker {
    state: State,
}

impl Default for RequestEndTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestEndTracker {
    pub const fn new() -> Self {
        Self {
            state: State::Head(Vec::new()),
        }
    }

    pub const fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Feed the next bytes of the inbound stream.
    pub fn feed(&mut self, data: &[u8]) -> Result<Progress, TrackError> {
        let mut pos = 0;
        loop {
            if let State::Done = self.state {
                return if pos == 0 && !data.is_empty() {
                    Err(TrackError::Finished)
                } else {
                    Ok(Progress::Done { consumed: pos })
                };
            }
            if pos == data.len() {
                return Ok(Progress::NeedMore);
            }
            pos += self.step(&data[pos..])?;
        }
    }

    /// Advance the state machine over a prefix of `data`, returning the
    /// number of bytes consumed. Consumes at least one byte unless the
    /// state completes without input.
    fn step(&mut self, data: &[u8]) -> Result<usize, TrackError> {
        match &mut self.state {
            State::Head(buf) => {
                let prior = buf.len();
                buf.extend_from_slice(data);
                match parse_head(buf)? {
                    Some((head_len, framing)) => {
                        self.state = framing;
                        Ok(head_len - prior)
                    }
                    None if buf.len() > MAX_HEAD_BYTES => Err(TrackError::HeadTooLarge),
                    None => Ok(data.len()),
                }
            }
            State::Fixed(remaining) => {
                let n = usize::try_from(*remaining).map_or(data.len(), |r| r.min(data.len()));
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.state = State::Done;
                }
                Ok(n)
            }
            State::ChunkSize(line) => {
                let Some((n, complete)) = take_line(line, data)? else {
                    return Ok(data.len());
                };
                let size = parse_chunk_size(&complete)?;
                self.state = if size == 0 {
                    State::Trailer(Vec::new())
                } else {
                    State::ChunkData(size)
                };
                Ok(n)
            }
            State::ChunkData(remaining) => {
                let n = usize::try_from(*remaining).map_or(data.len(), |r| r.min(data.len()));
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.state = State::ChunkDataEnd;
                }
                Ok(n)
            }
            State::ChunkDataEnd => match data[0] {
                b'\r' => Ok(1),
                b'\n' => {
                    self.state = State::ChunkSize(Vec::new());
                    Ok(1)
                }
                _ => Err(TrackError::Chunked),
            },
            State::Trailer(line) => {
                let Some((n, complete)) = take_line(line, data)? else {
                    return Ok(data.len());
                };
                if complete.is_empty() {
                    self.state = State::Done;
                }
                Ok(n)
            }
            State::Done => Ok(0),
        }
    }
}

/// Append bytes up to and including `\n` to `line`. Returns the consumed
/// count and the finished line (without CRLF) once a newline was seen.
fn take_line(line: &mut Vec<u8>, data: &[u8]) -> Result<Option<(usize, Vec<u8>)>, TrackError> {
    let Some(nl) = data.iter().position(|&b| b == b'\n') else {
        line.extend_from_slice(data);
        if line.len() > MAX_LINE_BYTES {
            return Err(TrackError::Chunked);
        }
        return Ok(None);
    };
    line.extend_from_slice(&data[..nl]);
    let mut complete = std::mem::take(line);
    if complete.last() == Some(&b'\r') {
        complete.pop();
    }
    Ok(Some((nl + 1, complete)))
}

/// `line` is a complete chunk-size line with its CRLF stripped.
fn parse_chunk_size(line: &[u8]) -> Result<u64, TrackError> {
    let mut framed = Vec::with_capacity(line.len() + 2);
    framed.extend_from_slice(line);
    framed.extend_from_slice(b"\r\n");
    match httparse::parse_chunk_size(&framed) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        Ok(httparse::Status::Partial) | Err(_) => Err(TrackError::Chunked),
    }
}

/// Parse a complete head from `buf`, returning its length and the body
/// framing state, or `None` when more bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, State)>, TrackError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(TrackError::Head(e.to_string())),
    };

    let mut chunked = false;
    let mut length: Option<u64> = None;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = String::from_utf8_lossy(header.value);
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        } else if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(TrackError::ContentLength)?;
            if length.is_some_and(|prev| prev != value) {
                return Err(TrackError::ContentLength);
            }
            length = Some(value);
        }
    }

    let framing = if chunked {
        State::ChunkSize(Vec::new())
    } else {
        match length {
            Some(0) | None => State::Done,
            Some(n) => State::Fixed(n),
        }
    };
    Ok(Some((head_len, framing)))
}

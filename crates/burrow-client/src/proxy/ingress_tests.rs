#![allow(clippy::unwrap_used, clippy::panic)]

use http_body_util::BodyExt;
use tokio::io::{AsyncWriteExt, BufReader};

use super::*;

fn local() -> SocketAddr {
    "127.0.0.1:7777".parse().unwrap()
}

// =========================================================================
// Request line
// =========================================================================

#[test]
fn request_line_splits_on_first_two_spaces() {
    let line = parse_request_line("GET http://e/a b HTTP/1.1").unwrap();
    assert_eq!(line.method, "GET");
    assert_eq!(line.target, "http://e/a");
    assert_eq!(line.proto, "b HTTP/1.1");

    assert!(parse_request_line("GET /").is_none());
    assert!(parse_request_line("GET").is_none());
}

#[tokio::test]
async fn peek_does_not_consume() {
    let data: &[u8] = b"GET http://e/ HTTP/1.1\r\nHost: e\r\n\r\n";
    let mut reader = BufReader::new(data);
    let line = peek_request_line(&mut reader).await.unwrap();
    assert_eq!(line, "GET http://e/ HTTP/1.1");
    assert_eq!(reader.buffer(), data);
}

#[tokio::test]
async fn empty_connection_is_no_request() {
    let mut reader = BufReader::new(&b""[..]);
    assert!(matches!(
        peek_request_line(&mut reader).await,
        Err(SessionError::NoRequest)
    ));
}

struct ResetReader;

impl tokio::io::AsyncRead for ResetReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        _buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
    }
}

#[tokio::test]
async fn read_error_is_not_an_empty_connection() {
    let mut reader = BufReader::new(ResetReader);
    match peek_request_line(&mut reader).await {
        Err(SessionError::Relay(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        other => panic!("expected relay error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_newline_is_bad_request() {
    let (mut client, server) = tokio::io::duplex(1024);
    client.write_all(b"GET http://e/ HTTP/1.1").await.unwrap();
    let mut reader = BufReader::new(server);
    assert!(matches!(
        peek_request_line(&mut reader).await,
        Err(SessionError::BadRequest)
    ));
}

// =========================================================================
// Classification
// =========================================================================

#[test]
fn connect_target_gets_default_port() {
    assert_eq!(
        classify("CONNECT example.com:443 HTTP/1.1", local(), b"").unwrap(),
        Ingress::Connect {
            target: "example.com:443".into()
        }
    );
    assert_eq!(
        classify("CONNECT example.com HTTP/1.1", local(), b"").unwrap(),
        Ingress::Connect {
            target: "example.com:80".into()
        }
    );
}

#[test]
fn pac_requests_are_local() {
    assert_eq!(classify("GET /pac HTTP/1.1", local(), b"").unwrap(), Ingress::Pac);
    assert_eq!(
        classify("GET http://127.0.0.1:7777/pac HTTP/1.1", local(), b"").unwrap(),
        Ingress::Pac
    );
    // Same path on another host is proxied.
    assert_eq!(
        classify("GET http://other.example/pac HTTP/1.1", local(), b"").unwrap(),
        Ingress::Reverse {
            target: "other.example:80".into()
        }
    );
}

#[test]
fn reverse_target_uses_scheme_default_port() {
    assert_eq!(
        classify("POST https://api.example/v1?q=1 HTTP/1.1", local(), b"").unwrap(),
        Ingress::Reverse {
            target: "api.example:443".into()
        }
    );
    assert_eq!(
        classify("GET http://api.example:8080/ HTTP/1.1", local(), b"").unwrap(),
        Ingress::Reverse {
            target: "api.example:8080".into()
        }
    );
}

#[test]
fn origin_form_falls_back_to_host_header() {
    let buffered = b"GET /index.html HTTP/1.1\r\nAccept: */*\r\nhost: site.example\r\n\r\n";
    assert_eq!(
        classify("GET /index.html HTTP/1.1", local(), buffered).unwrap(),
        Ingress::Reverse {
            target: "site.example:80".into()
        }
    );
    assert!(matches!(
        classify("GET /index.html HTTP/1.1", local(), b"GET /index.html HTTP/1.1\r\n"),
        Err(SessionError::Malformed(_))
    ));
}

#[test]
fn malformed_lines_are_rejected() {
    assert!(matches!(
        classify("garbage", local(), b""),
        Err(SessionError::Malformed(_))
    ));
    assert!(matches!(
        classify("CONNECT /nope HTTP/1.1", local(), b""),
        Err(SessionError::Malformed(_))
    ));
}

// =========================================================================
// Envelopes
// =========================================================================

#[tokio::test]
async fn connect_head_is_consumed_and_filtered() {
    let data: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\n\
        Host: example.com:443\r\n\
        Proxy-Connection: keep-alive\r\n\
        User-Agent: test\r\n\r\nTLSBYTES";
    let mut reader = BufReader::new(data);
    let head = read_request_head(&mut reader).await.unwrap();
    assert_eq!(head.method, "CONNECT");
    assert_eq!(reader.buffer(), b"TLSBYTES");

    let builder = EnvelopeBuilder::new("tunnel.example:443");
    let req = builder
        .connect(&head, "example.com:443", crate::tunnel::body::empty_body())
        .unwrap();
    assert_eq!(req.method(), Method::CONNECT);
    assert_eq!(req.headers()[HOST], "example.com:443");
    assert_eq!(req.headers()["user-agent"], "test");
    assert!(req.headers().get("proxy-connection").is_none());
}

#[test]
fn reverse_envelope_targets_endpoint_with_host() {
    let builder = EnvelopeBuilder::new("tunnel.example:443");
    let req = builder
        .reverse("api.example:80", crate::tunnel::body::empty_body())
        .unwrap();
    assert_eq!(req.method(), Method::POST);
    assert_eq!(req.uri().to_string(), "https://tunnel.example:443/r");
    assert_eq!(req.headers()[HOST], "api.example:80");
    assert!(req.headers().get(http::header::CONTENT_LENGTH).is_none());
}

#[tokio::test]
async fn tee_stops_at_request_end() {
    let data: &[u8] = b"POST http://e/ HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcNEXT";
    let body = request_tee(BufReader::new(data), CancellationToken::new());
    let bytes = body.collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], &data[..data.len() - 4]);
}

#[tokio::test]
async fn tee_reports_premature_eof() {
    let data: &[u8] = b"POST http://e/ HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
    let body = request_tee(BufReader::new(data), CancellationToken::new());
    let err = body.collect().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn tee_stops_on_cancel() {
    let (_client, server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    let body = request_tee(BufReader::new(server), cancel.clone());
    cancel.cancel();
    assert!(body.collect().await.unwrap().to_bytes().is_empty());
}

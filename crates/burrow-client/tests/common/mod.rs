//! In-process tunnel endpoint for integration tests: TLS on 127.0.0.1,
//! directly or inside a WebSocket, serving the control virtual hosts,
//! reverse envelopes and CONNECT echo streams over HTTP/2.

#![allow(dead_code, clippy::unwrap_used)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rcgen::{BasicConstraints, CertificateParams, IsCa, Issuer, KeyPair, KeyUsagePurpose};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_util::task::AbortOnDropHandle;

use burrow_client::tunnel::MessageStream;

pub const PAC_TEMPLATE: &str = "function FindProxyForURL(u, h) { return \"PROXY {{.}}\"; }";

/// CA plus one leaf certificate signed by it.
pub struct TestPki {
    pub ca_pem: String,
    pub leaf: CertificateDer<'static>,
    pub leaf_key: PrivatePkcs8KeyDer<'static>,
}

impl TestPki {
    pub fn generate(leaf_names: &[&str]) -> Self {
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        let issuer = Issuer::from_params(&ca_params, &ca_key);

        let leaf_params =
            CertificateParams::new(leaf_names.iter().map(ToString::to_string).collect::<Vec<_>>())
                .unwrap();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            leaf: leaf.der().clone(),
            leaf_key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
        }
    }

    /// Write the CA certificate to a PEM file inside `dir`.
    pub fn write_ca(&self, dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, &self.ca_pem).unwrap();
        path
    }

    fn server_config(&self, alpn: &[&[u8]]) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![self.leaf.clone()],
            PrivateKeyDer::Pkcs8(self.leaf_key.clone_key()),
        )
        .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }
}

/// Knobs and counters shared with the endpoint's connection tasks.
pub struct EndpointState {
    pub ping_second: u64,
    pub liveness_status: AtomicU16,
    pub accepted: AtomicUsize,
    pub liveness_probes: AtomicUsize,
    /// Request paths of accepted WebSocket upgrades.
    pub relay_paths: Mutex<Vec<String>>,
}

/// How the endpoint carries its TLS sessions.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Carrier {
    Tcp,
    WebSocket,
}

pub struct FakeEndpoint {
    pub addr: SocketAddr,
    carrier: Carrier,
    pub state: Arc<EndpointState>,
    _task: AbortOnDropHandle<()>,
}

impl FakeEndpoint {
    /// Endpoint negotiating `h2` and answering every request.
    pub async fn start(pki: &TestPki, ping_second: u64) -> Self {
        Self::start_with_alpn(pki, ping_second, &[b"h2"]).await
    }

    pub async fn start_with_alpn(pki: &TestPki, ping_second: u64, alpn: &[&[u8]]) -> Self {
        Self::launch(pki, ping_second, alpn, Carrier::Tcp).await
    }

    /// Endpoint running TLS inside WebSocket messages.
    pub async fn start_relayed(pki: &TestPki, ping_second: u64) -> Self {
        Self::launch(pki, ping_second, &[b"h2"], Carrier::WebSocket).await
    }

    async fn launch(pki: &TestPki, ping_second: u64, alpn: &[&[u8]], carrier: Carrier) -> Self {
        let acceptor = TlsAcceptor::from(pki.server_config(alpn));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(EndpointState {
            ping_second,
            liveness_status: AtomicU16::new(200),
            accepted: AtomicUsize::new(0),
            liveness_probes: AtomicUsize::new(0),
            relay_paths: Mutex::new(Vec::new()),
        });

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    match carrier {
                        Carrier::Tcp => serve_tunnel(&acceptor, tcp, state).await,
                        Carrier::WebSocket => serve_relayed(&acceptor, tcp, state).await,
                    }
                });
            }
        });

        Self {
            addr,
            carrier,
            state,
            _task: AbortOnDropHandle::new(task),
        }
    }

    pub fn url(&self) -> String {
        let scheme = match self.carrier {
            Carrier::Tcp => "tls",
            Carrier::WebSocket => "ws",
        };
        format!("{scheme}://127.0.0.1:{}", self.addr.port())
    }
}

async fn serve_relayed(acceptor: &TlsAcceptor, tcp: TcpStream, state: Arc<EndpointState>) {
    let paths = Arc::clone(&state);
    let record = move |req: &WsRequest, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
        paths.relay_paths.lock().unwrap().push(req.uri().path().to_string());
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, record).await else {
        return;
    };
    serve_tunnel(acceptor, MessageStream::new(ws), state).await;
}

async fn serve_tunnel<S>(acceptor: &TlsAcceptor, io: S, state: Arc<EndpointState>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let Ok(tls) = acceptor.accept(io).await else {
        return;
    };
    state.accepted.fetch_add(1, Ordering::SeqCst);
    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls), service)
        .await;
}

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

async fn handle(
    mut req: Request<Incoming>,
    state: Arc<EndpointState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();

    if req.method() == Method::CONNECT {
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            let Ok(upgraded) = upgrade.await else {
                return;
            };
            let (mut rd, mut wr) = tokio::io::split(TokioIo::new(upgraded));
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
            let _ = wr.shutdown().await;
        });
        return Ok(reply(StatusCode::OK, Bytes::new()));
    }

    let resp = match (req.method().clone(), host.as_str()) {
        (Method::HEAD, "i:80") => {
            state.liveness_probes.fetch_add(1, Ordering::SeqCst);
            let status = StatusCode::from_u16(state.liveness_status.load(Ordering::SeqCst))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            reply(status, Bytes::new())
        }
        (Method::GET, "i:81") => reply(
            StatusCode::OK,
            format!("{{\"PingSecond\":{}}}", state.ping_second),
        ),
        (Method::GET, "i:82" | "i:83") => reply(StatusCode::OK, PAC_TEMPLATE),
        (Method::POST, target) if req.uri().path() == "/r" => {
            let target = target.to_string();
            let raw = req.into_body().collect().await.unwrap().to_bytes();
            let echoed = String::from_utf8_lossy(&raw).into_owned();
            reply(
                StatusCode::OK,
                format!(
                    "HTTP/1.1 200 OK\r\nX-Target: {target}\r\nContent-Length: {}\r\n\r\n{echoed}",
                    echoed.len()
                ),
            )
        }
        _ => reply(StatusCode::NOT_FOUND, Bytes::new()),
    };
    Ok(resp)
}

//! Physical connection dialers.
//!
//! A dialer produces one TLS session, negotiated to `h2`, to the tunnel
//! endpoint. [`DirectDialer`] runs TLS straight over TCP; [`RelayedDialer`]
//! runs it inside a WebSocket opened on the endpoint's relay path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use burrow_core::{ClientConfig, EndpointScheme, TunnelEndpoint};

use super::adapter::MessageStream;
use super::error::{DialError, TlsSetupError};
use super::tls;

/// Byte stream a tunnel connection runs over.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Secured stream returned by a successful dial.
pub type TunnelStream = Box<dyn TunnelIo>;

/// WebSocket connection to the endpoint.
pub type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens new physical connections on demand.
pub trait TunnelDialer: Send + Sync + 'static {
    fn dial(&self) -> impl Future<Output = Result<TunnelStream, DialError>> + Send;
}

/// Dialer selected by the endpoint scheme.
pub enum EndpointDialer {
    Direct(DirectDialer),
    Relayed(RelayedDialer),
}

impl EndpointDialer {
    pub fn from_config(
        endpoint: &TunnelEndpoint,
        config: &ClientConfig,
    ) -> Result<Self, TlsSetupError> {
        let handshake = TunnelHandshake::from_config(endpoint, config)?;
        Ok(match endpoint.scheme() {
            EndpointScheme::Direct => Self::Direct(DirectDialer {
                addr: endpoint.connect_addr().to_string(),
                handshake,
                dial_timeout: config.dial_timeout(),
            }),
            EndpointScheme::Relayed => Self::Relayed(RelayedDialer {
                ws: WsConnector::from_config(endpoint, config)?,
                url: endpoint.relay_url(),
                handshake,
                ping_period: config.ping_period(),
            }),
        })
    }
}

impl TunnelDialer for EndpointDialer {
    async fn dial(&self) -> Result<TunnelStream, DialError> {
        match self {
            Self::Direct(d) => d.dial().await,
            Self::Relayed(d) => d.dial().await,
        }
    }
}

/// Inner TLS handshake shared by both strategies.
#[derive(Clone)]
pub struct TunnelHandshake {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TunnelHandshake {
    pub fn from_config(
        endpoint: &TunnelEndpoint,
        config: &ClientConfig,
    ) -> Result<Self, TlsSetupError> {
        Ok(Self {
            connector: TlsConnector::from(tls::tunnel_client_config(&config.tls)?),
            server_name: tls::server_name(endpoint, &config.tls)?,
        })
    }

    pub fn new(client_config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            connector: TlsConnector::from(client_config),
            server_name,
        }
    }

    /// Run the handshake over `io` and require `h2`. On failure `io` is
    /// dropped, closing it.
    pub async fn secure<S: TunnelIo>(&self, io: S) -> Result<TunnelStream, DialError> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), io)
            .await
            .map_err(|e| tls::handshake_error(&e))?;
        tls::check_alpn(stream.get_ref().1.alpn_protocol())?;
        Ok(Box::new(stream))
    }
}

async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream, DialError> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| DialError::connect(format!("timed out connecting to {addr}")))?
        .map_err(|e| DialError::connect(format!("{addr}: {e}")))?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(tcp)
}

/// TLS directly over TCP.
pub struct DirectDialer {
    addr: String,
    handshake: TunnelHandshake,
    dial_timeout: Duration,
}

impl DirectDialer {
    pub const fn new(addr: String, handshake: TunnelHandshake, dial_timeout: Duration) -> Self {
        Self {
            addr,
            handshake,
            dial_timeout,
        }
    }

    pub async fn dial(&self) -> Result<TunnelStream, DialError> {
        let tcp = connect_tcp(&self.addr, self.dial_timeout).await?;
        tokio::time::timeout(self.dial_timeout, self.handshake.secure(tcp))
            .await
            .map_err(|_| DialError::handshake("TLS handshake timed out"))?
    }
}

impl TunnelDialer for DirectDialer {
    async fn dial(&self) -> Result<TunnelStream, DialError> {
        Self::dial(self).await
    }
}

/// Opens WebSocket connections to the endpoint, optionally pinned to a
/// direct IP and wrapped in outer TLS for `wss`.
#[derive(Clone)]
pub struct WsConnector {
    connect_addr: String,
    outer: Option<Connector>,
    dial_timeout: Duration,
}

impl WsConnector {
    pub fn from_config(
        endpoint: &TunnelEndpoint,
        config: &ClientConfig,
    ) -> Result<Self, TlsSetupError> {
        let outer = if endpoint.outer_tls() {
            Some(Connector::Rustls(tls::outer_client_config(&config.tls)?))
        } else {
            None
        };
        Ok(Self {
            connect_addr: endpoint.connect_addr().to_string(),
            outer,
            dial_timeout: config.dial_timeout(),
        })
    }

    pub async fn open(&self, url: &str) -> Result<WsConnection, DialError> {
        let request = url
            .into_client_request()
            .map_err(|e| DialError::connect(format!("bad relay URL {url}: {e}")))?;
        let tcp = connect_tcp(&self.connect_addr, self.dial_timeout).await?;
        let upgrade = tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp,
            None,
            self.outer.clone(),
        );
        let (ws, _response) = tokio::time::timeout(self.dial_timeout, upgrade)
            .await
            .map_err(|_| DialError::connect(format!("timed out opening {url}")))?
            .map_err(|e| DialError::connect(format!("WebSocket upgrade to {url} failed: {e}")))?;
        Ok(ws)
    }
}

/// TLS over a WebSocket on the endpoint's relay path.
pub struct RelayedDialer {
    ws: WsConnector,
    url: String,
    handshake: TunnelHandshake,
    ping_period: Duration,
}

impl RelayedDialer {
    pub const fn new(
        ws: WsConnector,
        url: String,
        handshake: TunnelHandshake,
        ping_period: Duration,
    ) -> Self {
        Self {
            ws,
            url,
            handshake,
            ping_period,
        }
    }

    pub async fn dial(&self) -> Result<TunnelStream, DialError> {
        let ws = self.ws.open(&self.url).await?;
        let stream = MessageStream::new(ws).with_ping_period(self.ping_period);
        tokio::time::timeout(self.ws.dial_timeout, self.handshake.secure(stream))
            .await
            .map_err(|_| DialError::handshake("TLS handshake timed out"))?
    }
}

impl TunnelDialer for RelayedDialer {
    async fn dial(&self) -> Result<TunnelStream, DialError> {
        Self::dial(self).await
    }
}

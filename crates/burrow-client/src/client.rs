//! One proxy client per proxy spec: resolves the endpoint, binds the local
//! ports and serves them with the configured relay mode.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::task::AbortOnDropHandle;
use tracing::{info, warn};

use burrow_core::{ClientConfig, ProxySpec, RelayMode, TunnelEndpoint, TunnelTarget};

use crate::discovery::{self, DiscoveryError};
use crate::legacy::{ConnectionPool, PooledRelay, WsPipeDialer};
use crate::proxy::pac::fetch_pac;
use crate::proxy::{ConnectionHandler, EnvelopeBuilder, PacCache, ProxySessionHandler, listener};
use crate::tunnel::dialer::WsConnector;
use crate::tunnel::error::TlsSetupError;
use crate::tunnel::keepalive::PROBE_TIMEOUT;
use crate::tunnel::{CapabilityCache, EndpointDialer, MuxTransport};

type MuxHandler = ProxySessionHandler<MuxTransport<EndpointDialer>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] burrow_core::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsSetupError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Failed to listen on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Listener stopped: {0}")]
    Accept(#[from] io::Error),

    #[error("Listener task failed: {0}")]
    Task(String),
}

/// Control-plane state owned by one client and shared by all of its
/// tunnel connections.
pub struct ControlPlane {
    pub capabilities: Arc<CapabilityCache>,
    pub pac: Arc<PacCache>,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            capabilities: Arc::new(CapabilityCache::new()),
            pac: Arc::new(PacCache::new()),
        }
    }
}

impl Default for ControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

/// Local proxy ports bound to one tunnel endpoint.
pub struct ProxyClient {
    endpoint: TunnelEndpoint,
    ports: Vec<u16>,
    config: ClientConfig,
}

impl ProxyClient {
    pub const fn new(endpoint: TunnelEndpoint, ports: Vec<u16>, config: ClientConfig) -> Self {
        Self {
            endpoint,
            ports,
            config,
        }
    }

    /// Build a client from a parsed spec, fetching the endpoint first when
    /// the proxy spec names a discovery URL.
    pub async fn from_spec(spec: ProxySpec, config: &ClientConfig) -> Result<Self, ClientError> {
        let endpoint = match spec.target {
            TunnelTarget::Endpoint(endpoint) => endpoint,
            TunnelTarget::Discovery(url) => discovery::discover(&url, config.dial_timeout()).await?,
        };
        Ok(Self::new(endpoint, spec.ports, config.clone()))
    }

    pub const fn endpoint(&self) -> &TunnelEndpoint {
        &self.endpoint
    }

    /// Bind every port and serve until `shutdown` fires or a listener hits
    /// a non-transient accept error.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let listeners = bind_all(&self.ports).await?;
        info!(
            endpoint = %self.endpoint.url(),
            ports = ?self.ports,
            mode = ?self.config.mode,
            "Proxy client started"
        );

        match self.config.mode {
            RelayMode::Multiplexed => {
                let (handler, _pac_fetch) = self.multiplexed_handler()?;
                serve_all(listeners, handler, shutdown).await
            }
            RelayMode::Pooled => {
                let handler = self.pooled_handler().await?;
                serve_all(listeners, handler, shutdown).await
            }
        }
    }

    /// The returned task fills the PAC cache while the listeners already
    /// serve; dropping it cancels the fetch.
    fn multiplexed_handler(&self) -> Result<(Arc<MuxHandler>, AbortOnDropHandle<()>), ClientError> {
        let control = ControlPlane::new();
        let dialer = EndpointDialer::from_config(&self.endpoint, &self.config)?;
        let transport = Arc::new(MuxTransport::new(dialer, Arc::clone(&control.capabilities)));

        let pac_fetch = tokio::spawn(load_pac(
            Arc::clone(&transport),
            Arc::clone(&control.pac),
            self.config.dial_timeout() + PROBE_TIMEOUT,
        ));

        let handler = Arc::new(ProxySessionHandler::new(
            transport,
            EnvelopeBuilder::new(self.endpoint.authority()),
            control.pac,
            self.config.buf_size,
        ));
        Ok((handler, AbortOnDropHandle::new(pac_fetch)))
    }

    async fn pooled_handler(&self) -> Result<Arc<PooledRelay<WsPipeDialer>>, ClientError> {
        let ws = WsConnector::from_config(&self.endpoint, &self.config)?;
        let pool = ConnectionPool::new(
            WsPipeDialer::new(ws, self.endpoint.pipe_url()),
            self.config.pool.size,
            self.config.pool.affinity,
        );
        pool.warm_up().await;
        info!(size = pool.size(), affinity = ?self.config.pool.affinity, "Pipe pool ready");

        Ok(Arc::new(PooledRelay::new(
            pool,
            self.config.buf_size,
            self.config.ping_period(),
        )))
    }
}

async fn load_pac(
    transport: Arc<MuxTransport<EndpointDialer>>,
    pac: Arc<PacCache>,
    limit: Duration,
) {
    match tokio::time::timeout(limit, fetch_pac(transport.as_ref(), false)).await {
        Ok(Ok(template)) => pac.store(template).await,
        Ok(Err(e)) => warn!(error = %e, "PAC unavailable, PAC requests will be closed"),
        Err(_) => warn!(
            timeout_secs = limit.as_secs(),
            "PAC fetch timed out, PAC requests will be closed"
        ),
    }
}

async fn bind_all(ports: &[u16]) -> Result<Vec<TcpListener>, ClientError> {
    let mut listeners = Vec::with_capacity(ports.len());
    for &port in ports {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClientError::Bind { port, source })?;
        info!(addr = %listener.local_addr().unwrap_or(addr), "Listening");
        listeners.push(listener);
    }
    Ok(listeners)
}

async fn serve_all<H>(
    listeners: Vec<TcpListener>,
    handler: Arc<H>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ClientError>
where
    H: ConnectionHandler<TcpStream>,
{
    let mut tasks = JoinSet::new();
    for listener in listeners {
        tasks.spawn(listener::serve(listener, Arc::clone(&handler), shutdown.clone()));
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ClientError::Accept(e)),
            Err(e) => return Err(ClientError::Task(e.to_string())),
        }
    }
    Ok(())
}

/// Run one client per spec until `shutdown` fires. The first client to
/// fail stops the rest.
pub async fn run_all(
    specs: Vec<ProxySpec>,
    config: &ClientConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ClientError> {
    let mut clients = JoinSet::new();
    for spec in specs {
        let client = ProxyClient::from_spec(spec, config).await?;
        clients.spawn(client.run(shutdown.clone()));
    }

    while let Some(joined) = clients.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(ClientError::Task(e.to_string())),
        }
    }
    Ok(())
}

//! burrow client
//!
//! Local HTTP proxy tunnelled to a remote endpoint over TLS + HTTP/2.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use burrow_core::config::{ClientConfig, load_config};
use burrow_core::endpoint::parse_proxy_specs;
use burrow_core::tracing_init::{client_filter, init_tracing};
use burrow_core::{PoolAffinity, RelayMode};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(version, about = "burrow - local HTTP proxy tunnelled over TLS + HTTP/2")]
struct Args {
    /// Proxy spec(s): `ports[:ports...],tunnelURL[,directIP]`, joined by `|`.
    #[arg(long, env = "BURROW_PROXY")]
    proxy: Option<String>,

    /// JSON config file (defaults to the global `burrow/config.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Buffer size for inbound reads and relayed frames.
    #[arg(long)]
    buf_size: Option<usize>,

    /// Ping period in seconds for message-relayed connections.
    #[arg(long)]
    ping_period: Option<u64>,

    /// Timeout in seconds for establishing one tunnel connection.
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Relay mode: `multiplexed` or `pooled`.
    #[arg(long)]
    mode: Option<RelayMode>,

    /// Number of pooled pipes (pooled mode).
    #[arg(long)]
    pool_size: Option<usize>,

    /// Always take the lowest free pool slot instead of rotating.
    #[arg(long)]
    pool_first_free: bool,

    /// Skip TLS verification of the tunnel endpoint.
    #[arg(long, env = "BURROW_INSECURE")]
    insecure: bool,

    /// Extra CA bundle (PEM) trusted for the tunnel endpoint.
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Expected TLS server name of the tunnel endpoint.
    #[arg(long)]
    server_name: Option<String>,

    /// Log level filter (e.g. "info", "debug").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// CLI flags win over file and environment values.
    fn apply(self, config: &mut ClientConfig) {
        if let Some(proxy) = self.proxy {
            config.proxy = Some(proxy);
        }
        if let Some(size) = self.buf_size {
            config.buf_size = size;
        }
        if let Some(secs) = self.ping_period {
            config.ping_period_secs = secs;
        }
        if let Some(secs) = self.dial_timeout {
            config.dial_timeout_secs = secs;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(size) = self.pool_size {
            config.pool.size = size;
        }
        if self.pool_first_free {
            config.pool.affinity = PoolAffinity::FirstFree;
        }
        if self.insecure {
            config.tls.insecure_skip_verify = true;
        }
        if let Some(path) = self.ca_cert {
            config.tls.ca_cert_path = Some(path);
        }
        if let Some(name) = self.server_name {
            config.tls.server_name = Some(name);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.log_json {
            config.log_json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Err only means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = load_config(args.config.as_deref()).context("Failed to load config")?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&client_filter(&config.log_level), config.log_json);

    let raw = config
        .proxy
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No proxy spec given (--proxy or BURROW_PROXY)"))?;
    let specs = parse_proxy_specs(&raw)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        proxies = specs.len(),
        mode = ?config.mode,
        "Starting burrow"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let clients = burrow_client::run_all(specs, &config, shutdown_rx);
    tokio::pin!(clients);

    tokio::select! {
        result = &mut clients => {
            result?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    clients.await?;

    info!("burrow stopped");
    Ok(())
}

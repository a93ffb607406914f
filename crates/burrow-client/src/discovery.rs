//! Endpoint discovery for `http(s)` tunnel URLs.
//!
//! A discovery URL serves `{"schema": "wss", "bind": "host:port"}`; the
//! real tunnel endpoint is `<schema>://<bind>`.

use std::time::Duration;

use thiserror::Error;
use tracing::info;
use url::Url;

use burrow_core::TunnelEndpoint;
use burrow_core::endpoint::DiscoveryInfo;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discovery returned {status}")]
    Status { status: u16 },

    #[error("Discovered endpoint is invalid: {0}")]
    Endpoint(#[from] burrow_core::Error),
}

/// Fetch the discovery document at `url` and build the endpoint it names.
pub async fn discover(url: &Url, timeout: Duration) -> Result<TunnelEndpoint, DiscoveryError> {
    // reqwest is built without a default provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let http = reqwest::Client::builder().timeout(timeout).build()?;
    let resp = http.get(url.as_str()).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(DiscoveryError::Status {
            status: status.as_u16(),
        });
    }

    let info: DiscoveryInfo = resp.json().await?;
    let endpoint = TunnelEndpoint::from_discovery(&info)?;
    info!(%url, endpoint = %endpoint.url(), "Discovered tunnel endpoint");
    Ok(endpoint)
}

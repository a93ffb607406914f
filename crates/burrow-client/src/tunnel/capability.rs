//! Capability info advertised by the tunnel endpoint.

use std::time::Duration;

use http::Method;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::control::{self, INFO_HOST};
use super::error::CapabilityFetchError;
use super::transport::RoundTrip;

/// Endpoint control-plane settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CapabilityInfo {
    /// Keepalive probe interval in seconds.
    #[serde(rename = "PingSecond")]
    pub ping_second: u64,
}

impl CapabilityInfo {
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_second)
    }
}

/// Lazily fetched, cached-for-life capability info.
///
/// The mutex is held across the fetch so concurrent callers wait for a
/// single request. Failures are not cached.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    cached: Mutex<Option<CapabilityInfo>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached info, or fetch it over `rt`.
    pub async fn resolve<R>(&self, rt: &R) -> Result<CapabilityInfo, CapabilityFetchError>
    where
        R: RoundTrip + ?Sized,
    {
        let mut cached = self.cached.lock().await;
        if let Some(info) = *cached {
            return Ok(info);
        }

        let body = control::fetch(rt, Method::GET, INFO_HOST).await?;
        let info: CapabilityInfo = serde_json::from_slice(&body)?;
        if info.ping_second == 0 {
            return Err(CapabilityFetchError::ZeroInterval);
        }

        debug!(ping_second = info.ping_second, "Capability info resolved");
        *cached = Some(info);
        Ok(info)
    }

    pub async fn get(&self) -> Option<CapabilityInfo> {
        *self.cached.lock().await
    }
}

#[cfg(test)]
#[path = "capability_tests.rs"]
mod tests;

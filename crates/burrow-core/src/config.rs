//! Configuration resolution for burrow.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Config file (`--config`, or the global `burrow/config.json`)
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default size of relay buffers and WebSocket frames (32 KiB).
pub const DEFAULT_BUF_SIZE: usize = 32 << 10;

/// Complete client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Proxy specification(s): `ports[:ports...],tunnelURL[,directIP]`,
    /// several joined by `|`.
    pub proxy: Option<String>,
    /// Buffer size for inbound reads and relayed frames.
    pub buf_size: usize,
    /// Ping period for message-relayed connections and the pooled relay.
    pub ping_period_secs: u64,
    /// Upper bound on establishing one physical tunnel connection.
    pub dial_timeout_secs: u64,
    /// Which relay implementation serves inbound connections.
    pub mode: RelayMode,
    pub pool: PoolConfig,
    pub tls: TlsSettings,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            buf_size: DEFAULT_BUF_SIZE,
            ping_period_secs: 40,
            dial_timeout_secs: 30,
            mode: RelayMode::default(),
            pool: PoolConfig::default(),
            tls: TlsSettings::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ClientConfig {
    pub const fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.buf_size == 0 {
            return Err(Error::Config("buf_size must be positive".into()));
        }
        if self.ping_period_secs == 0 {
            return Err(Error::Config("ping_period_secs must be positive".into()));
        }
        if self.dial_timeout_secs == 0 {
            return Err(Error::Config("dial_timeout_secs must be positive".into()));
        }
        if self.mode == RelayMode::Pooled && self.pool.size == 0 {
            return Err(Error::Config("pool.size must be positive in pooled mode".into()));
        }
        Ok(())
    }
}

/// Relay implementation used for inbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMode {
    /// Every inbound connection becomes a stream on a shared HTTP/2 tunnel.
    #[default]
    Multiplexed,
    /// Every inbound connection claims a dedicated pooled WebSocket.
    Pooled,
}

impl std::str::FromStr for RelayMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "multiplexed" => Ok(Self::Multiplexed),
            "pooled" => Ok(Self::Pooled),
            other => Err(Error::Config(format!("unknown relay mode: {other}"))),
        }
    }
}

/// How the pooled relay picks a slot for a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolAffinity {
    /// Rotate the starting slot on every claim.
    #[default]
    RoundRobin,
    /// Always take the lowest-numbered free slot.
    FirstFree,
}

/// Pooled relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub affinity: PoolAffinity,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            affinity: PoolAffinity::default(),
        }
    }
}

/// TLS settings for the inner (tunnel) handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Skip certificate and hostname verification (test setups only).
    pub insecure_skip_verify: bool,
    /// Extra CA bundle (PEM) trusted in addition to the webpki roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Expected server name; defaults to the endpoint host.
    pub server_name: Option<String>,
}

/// Load configuration with layered resolution.
///
/// An explicit `path` must exist; otherwise the global config file is used
/// when present.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => ClientConfig::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("burrow").join("config.json"))
}

/// Load a config file from disk.
pub fn load_config_file(path: &Path) -> Result<ClientConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {e}", path.display()))
    })?;
    let config = serde_json::from_str(&content)?;
    tracing::debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Apply environment variable overrides.
///
/// `lookup` abstracts `std::env::var` so callers can inject values.
pub fn apply_env_overrides(config: &mut ClientConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(proxy) = lookup("BURROW_PROXY") {
        config.proxy = Some(proxy);
    }
    if let Some(level) = lookup("BURROW_LOG_LEVEL") {
        config.log_level = level;
    }
    if let Some(size) = lookup("BURROW_BUF_SIZE").and_then(|v| v.parse().ok()) {
        config.buf_size = size;
    }
    if let Some(v) = lookup("BURROW_INSECURE") {
        config.tls.insecure_skip_verify = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.buf_size, 32 * 1024);
        assert_eq!(config.ping_period(), Duration::from_secs(40));
        assert_eq!(config.mode, RelayMode::Multiplexed);
        assert_eq!(config.pool.affinity, PoolAffinity::RoundRobin);
        assert!(!config.tls.insecure_skip_verify);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"mode": "pooled", "pool": {"affinity": "first-free"}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.mode, RelayMode::Pooled);
        assert_eq!(config.pool.affinity, PoolAffinity::FirstFree);
        assert_eq!(config.pool.size, 4);
        assert_eq!(config.buf_size, DEFAULT_BUF_SIZE);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("BURROW_LOG_LEVEL", "debug"),
            ("BURROW_BUF_SIZE", "4096"),
            ("BURROW_INSECURE", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = ClientConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.buf_size, 4096);
        assert!(config.tls.insecure_skip_verify);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn unparsable_env_value_is_ignored() {
        let mut config = ClientConfig::default();
        apply_env_overrides(&mut config, |k| {
            (k == "BURROW_BUF_SIZE").then(|| "lots".to_string())
        });
        assert_eq!(config.buf_size, DEFAULT_BUF_SIZE);
    }

    #[test]
    fn validate_rejects_zero_values() {
        let config = ClientConfig {
            ping_period_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut pooled = ClientConfig {
            mode: RelayMode::Pooled,
            ..Default::default()
        };
        pooled.pool.size = 0;
        assert!(pooled.validate().is_err());
    }

    #[test]
    fn relay_mode_from_str() {
        assert_eq!("pooled".parse::<RelayMode>().unwrap(), RelayMode::Pooled);
        assert!("bogus".parse::<RelayMode>().is_err());
    }
}

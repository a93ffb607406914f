//! Tunnel endpoints and proxy specifications.
//!
//! A proxy spec has the shape `ports[:ports...],tunnelURL[,directIP]` and
//! several specs may be joined with `|`, e.g.
//! `7777:7778,wss://tunnel.example.com,203.0.113.7|8888,tcp://other:4443`.
//!
//! The tunnel URL scheme selects how physical connections are dialled:
//! `tcp`/`tls` run TLS directly over TCP, `ws`/`wss` run TLS inside a
//! WebSocket. `http`/`https` URLs are discovery URLs that describe the real
//! endpoint in a small JSON document.

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// Sub-path of a message-relayed endpoint carrying TLS-over-WebSocket.
pub const RELAY_PATH: &str = "/p";

/// Sub-path of a message-relayed endpoint carrying raw pooled pipes.
pub const PIPE_PATH: &str = "/";

/// Dial strategy implied by the tunnel URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    /// TLS directly over a TCP stream (`tcp://`, `tls://`).
    Direct,
    /// TLS over a WebSocket carried by `ws://` or `wss://`.
    Relayed,
}

/// Immutable description of the remote tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEndpoint {
    url: Url,
    scheme: EndpointScheme,
    authority: String,
    direct_addr: Option<String>,
    relay_path: String,
    pipe_path: String,
}

impl TunnelEndpoint {
    /// Parse a tunnel URL, optionally pinning the TCP destination to
    /// `direct_ip` (the port is kept from the URL).
    pub fn parse(raw: &str, direct_ip: Option<&str>) -> Result<Self> {
        Self::from_url(Url::parse(raw)?, direct_ip)
    }

    pub fn from_url(url: Url, direct_ip: Option<&str>) -> Result<Self> {
        let scheme = match url.scheme() {
            "tcp" | "tls" => EndpointScheme::Direct,
            "ws" | "wss" => EndpointScheme::Relayed,
            other => {
                return Err(Error::ProxySpec(format!(
                    "unsupported tunnel scheme: {other}"
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ProxySpec(format!("tunnel URL has no host: {url}")))?;
        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| endpoint_default_port(url.scheme()));
        let authority = format!("{host}:{port}");
        let direct_addr = direct_ip
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| join_host_port(ip, port));

        Ok(Self {
            url,
            scheme,
            authority,
            direct_addr,
            relay_path: RELAY_PATH.to_string(),
            pipe_path: PIPE_PATH.to_string(),
        })
    }

    /// Build the endpoint advertised by a discovery document.
    pub fn from_discovery(info: &DiscoveryInfo) -> Result<Self> {
        Self::parse(&format!("{}://{}", info.schema, info.bind), None)
    }

    pub const fn scheme(&self) -> EndpointScheme {
        self.scheme
    }

    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` of the endpoint, port always present.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Endpoint host with the port stripped (IPv6 brackets kept).
    pub fn host(&self) -> &str {
        host_without_port(&self.authority)
    }

    /// Address the TCP connection is actually opened to.
    pub fn connect_addr(&self) -> &str {
        self.direct_addr.as_deref().unwrap_or(&self.authority)
    }

    pub fn direct_addr(&self) -> Option<&str> {
        self.direct_addr.as_deref()
    }

    /// Whether the outer WebSocket runs over TLS (`wss`).
    pub fn outer_tls(&self) -> bool {
        self.url.scheme() == "wss"
    }

    /// WebSocket URL carrying TLS-over-WebSocket physical connections.
    pub fn relay_url(&self) -> String {
        self.join_path(&self.relay_path)
    }

    /// WebSocket URL carrying raw pooled pipes.
    pub fn pipe_url(&self) -> String {
        self.join_path(&self.pipe_path)
    }

    #[must_use]
    pub fn with_relay_path(mut self, path: impl Into<String>) -> Self {
        self.relay_path = path.into();
        self
    }

    #[must_use]
    pub fn with_pipe_path(mut self, path: impl Into<String>) -> Self {
        self.pipe_path = path.into();
        self
    }

    fn join_path(&self, suffix: &str) -> String {
        let base = self.url.as_str().trim_end_matches('/');
        if suffix == "/" {
            format!("{base}/")
        } else {
            format!("{base}{suffix}")
        }
    }
}

/// JSON document served by a discovery URL.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryInfo {
    pub schema: String,
    pub bind: String,
}

/// Where a proxy spec's tunnel lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelTarget {
    Endpoint(TunnelEndpoint),
    /// Endpoint must first be fetched from this `http(s)` URL.
    Discovery(Url),
}

/// One parsed `ports,tunnelURL[,directIP]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub ports: Vec<u16>,
    pub target: TunnelTarget,
}

/// Parse a `|`-separated list of proxy specs.
pub fn parse_proxy_specs(raw: &str) -> Result<Vec<ProxySpec>> {
    raw.split('|').map(parse_proxy_spec).collect()
}

fn parse_proxy_spec(raw: &str) -> Result<ProxySpec> {
    let parts: Vec<&str> = raw.trim().split(',').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(Error::ProxySpec(format!(
            "every proxy must have 2-3 parts: {parts:?}"
        )));
    }

    let ports = parts[0]
        .split(':')
        .map(|p| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| Error::ProxySpec(format!("bad port {p:?}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let url = Url::parse(parts[1].trim())?;
    let target = if matches!(url.scheme(), "http" | "https") {
        TunnelTarget::Discovery(url)
    } else {
        TunnelTarget::Endpoint(TunnelEndpoint::from_url(url, parts.get(2).copied())?)
    };

    Ok(ProxySpec { ports, target })
}

/// Port used by requests whose authority carries none.
pub fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "wss" => 443,
        _ => 80,
    }
}

fn endpoint_default_port(scheme: &str) -> u16 {
    match scheme {
        "ws" | "http" => 80,
        _ => 443,
    }
}

/// Append the scheme's default port to `authority` unless it has one.
pub fn authority_with_port(scheme: &str, authority: &str) -> String {
    if has_port(authority) {
        authority.to_string()
    } else {
        format!("{authority}:{}", default_port(scheme))
    }
}

/// Strip a trailing `:port` from `authority`.
pub fn host_without_port(authority: &str) -> &str {
    if has_port(authority) {
        authority
            .rfind(':')
            .map_or(authority, |i| &authority[..i])
    } else {
        authority
    }
}

fn has_port(authority: &str) -> bool {
    match (authority.rfind(':'), authority.rfind(']')) {
        (Some(colon), Some(bracket)) => colon > bracket,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

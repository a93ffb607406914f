//! Tunnel error types.

use std::fmt;
use std::path::PathBuf;

/// Stage of a physical connection dial that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPhase {
    /// TCP connect or WebSocket upgrade.
    Connect,
    /// TLS handshake, other than certificate rejection.
    Handshake,
    /// Certificate or hostname rejected by the verifier.
    Verify,
    /// ALPN did not settle on `h2`.
    Protocol,
}

impl fmt::Display for DialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Handshake => "handshake",
            Self::Verify => "verify",
            Self::Protocol => "protocol",
        })
    }
}

/// Failure to open a physical tunnel connection.
#[derive(Debug, thiserror::Error)]
#[error("Tunnel dial failed ({phase}): {message}")]
pub struct DialError {
    pub phase: DialPhase,
    pub message: String,
}

impl DialError {
    pub fn new(phase: DialPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(DialPhase::Connect, message)
    }

    pub fn handshake(message: impl Into<String>) -> Self {
        Self::new(DialPhase::Handshake, message)
    }

    pub fn verify(message: impl Into<String>) -> Self {
        Self::new(DialPhase::Verify, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(DialPhase::Protocol, message)
    }
}

/// Errors from sending a request over the multiplexed tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("HTTP/2 error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid tunnel request: {0}")]
    Request(String),
}

/// Errors from control-plane requests (capability info, PAC).
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Control host {host} answered {status}")]
    Status { host: &'static str, status: u16 },

    #[error("Failed to read control response: {0}")]
    Body(#[from] std::io::Error),

    #[error("Malformed capability info: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Capability info advertises a zero ping interval")]
    ZeroInterval,

    #[error("PAC template is not valid UTF-8")]
    InvalidPac,
}

/// Error returned by the capability fetcher.
pub type CapabilityFetchError = ControlError;

/// Errors building TLS client configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsSetupError {
    #[error("Failed to load CA bundle {}: {message}", path.display())]
    CaBundle { path: PathBuf, message: String },

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Invalid TLS server name: {0}")]
    ServerName(String),
}

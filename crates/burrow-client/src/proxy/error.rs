//! Inbound session error types.

use crate::tunnel::TransportError;

/// Why an inbound proxy session ended without relaying.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The connection closed before any byte arrived.
    #[error("No request in connection")]
    NoRequest,

    /// Buffered bytes hold no complete request line.
    #[error("Bad request in connection")]
    BadRequest,

    #[error("Malformed request: {0}")]
    Malformed(String),

    /// A PAC request arrived but no template is cached.
    #[error("PAC template unavailable")]
    PacUnavailable,

    #[error("Tunnel request failed: {0}")]
    Upstream(#[from] TransportError),

    #[error("Tunnel endpoint answered {0}")]
    UpstreamStatus(u16),

    #[error("Relay I/O error: {0}")]
    Relay(#[from] std::io::Error),
}

impl SessionError {
    /// Errors caused by the local client rather than the tunnel.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NoRequest | Self::BadRequest | Self::Malformed(_)
        )
    }
}

//! Error types for the burrow core library.

use thiserror::Error;

/// Result type alias using burrow's core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for burrow configuration and endpoint handling.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed proxy specification (`ports,tunnelURL[,directIP]`)
    #[error("Invalid proxy spec: {0}")]
    ProxySpec(String),

    /// Tunnel URL could not be parsed
    #[error("Invalid tunnel URL: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

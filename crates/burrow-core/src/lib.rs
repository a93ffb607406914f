//! burrow core library
//!
//! Shared functionality for burrow components:
//! - Tunnel endpoint and proxy-spec parsing
//! - Client configuration resolution
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod endpoint;
pub mod error;
pub mod tracing_init;

pub use config::{ClientConfig, PoolAffinity, RelayMode};
pub use endpoint::{EndpointScheme, ProxySpec, TunnelEndpoint, TunnelTarget};
pub use error::{Error, Result};

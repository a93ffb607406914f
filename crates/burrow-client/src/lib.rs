//! burrow client library
//!
//! A local HTTP proxy whose traffic travels to a remote tunnel endpoint
//! over a TLS-secured, HTTP/2-multiplexed connection:
//! - `tunnel`: dialing, multiplexed transport and the control plane
//! - `proxy`: inbound classification and per-connection sessions
//! - `legacy`: pooled WebSocket pipes relaying raw bytes
//! - `client`: wiring of one proxy spec into running listeners

pub mod client;
pub mod discovery;
pub mod legacy;
pub mod proxy;
pub mod tunnel;

pub use client::{ClientError, ProxyClient, run_all};

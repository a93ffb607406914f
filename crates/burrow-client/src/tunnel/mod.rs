//! Secured, multiplexed tunnel to the remote endpoint.
//!
//! Physical connections are TLS sessions negotiated to `h2`, dialled either
//! directly over TCP or inside a WebSocket. Each one carries many HTTP/2
//! streams and is watched by its own keepalive monitor.

pub mod adapter;
pub mod body;
pub mod capability;
pub mod control;
pub mod dialer;
pub mod error;
pub mod keepalive;
pub mod tls;
pub mod transport;

pub use adapter::MessageStream;
pub use body::{TunnelBody, TunnelResponse};
pub use capability::{CapabilityCache, CapabilityInfo};
pub use dialer::{EndpointDialer, TunnelDialer, TunnelStream};
pub use error::{CapabilityFetchError, ControlError, DialError, DialPhase, TransportError};
pub use keepalive::{LivenessFailure, MonitorExit};
pub use transport::{MuxTransport, PhysicalConnection, RoundTrip};

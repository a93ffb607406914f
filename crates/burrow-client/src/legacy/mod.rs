//! Pooled relay mode.
//!
//! Each inbound connection claims one WebSocket pipe from a fixed pool and
//! its raw bytes are relayed over it unchanged; the endpoint does the
//! HTTP parsing.

pub mod pool;
pub mod relay;

pub use pool::{ConnectionPool, PipeDialer, SlotGuard, WsPipeDialer};
pub use relay::{PooledRelay, RelayEnd, RelayError, relay};

//! Local HTTP proxy front end.
//!
//! Accepts inbound connections, classifies the first request and relays it
//! over the tunnel transport.

pub mod error;
pub mod ingress;
pub mod listener;
pub mod pac;
pub mod request_end;
pub mod session;

pub use error::SessionError;
pub use ingress::{EnvelopeBuilder, Ingress};
pub use listener::{AcceptBackoff, Acceptor, ConnectionHandler};
pub use pac::{PacCache, PacTemplate};
pub use session::{ProxySessionHandler, SessionOutcome};

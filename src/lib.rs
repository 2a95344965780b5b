//! siprelay - a SIP stateful proxy with integrated B2BUA media relay
//!
//! Terminates and re-originates SIP dialogs between endpoints, authenticates
//! registrations, routes in-dialog requests, and relays RTP/RTCP so that two
//! user agents behind NAT can exchange media through the server.

pub mod allocator;
pub mod auth;
pub mod cdr;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod limits;
pub mod media;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod sdp;
pub mod timers;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::{MediaMode, RelayConfig};
pub use error::{RelayError, RelayResult};
pub use message::SipMessage;
pub use proxy::Core;
pub use transport::{CoreEvent, ReplySink};

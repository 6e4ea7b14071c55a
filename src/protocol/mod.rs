//! Protocol message types for tunnel communication.
//!
//! Defines the JSON message format used on the session channel:
//! - [`Frame`] - Envelope for everything sent either way
//! - [`RelayedRequest`] / [`RelayedResponse`] - HTTP tunnel payloads
//! - [`TcpEvent`] - TCP tunnel payloads, tagged by connection id
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;

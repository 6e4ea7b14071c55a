//! Tunnel client implementation.
//!
//! This module provides the core tunnel functionality:
//! - [`ControlClient`] - Broker control API (create and stop tunnels)
//! - Session channel with a single writer and in-order frame dispatch
//! - HTTP relay and TCP forwarder that serve frames against the local service
//! - [`Controller`] - Lifecycle state machine and shutdown path

mod control;
mod http_relay;
mod lifecycle;
mod session;
mod tcp_forwarder;

pub use control::{Broker, ControlClient};
pub use lifecycle::{spawn_signal_listener, Controller, LifecycleState, TunnelOptions};
pub use session::SessionState;

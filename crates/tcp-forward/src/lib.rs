//! Raw TCP forwarder for the remote-gateway project.
//!
//! This crate accepts connections on a public listening socket and relays the
//! bytes of each one to a fixed upstream address. It has no protocol
//! awareness: whatever the browser and the agent speak over the socket
//! (HTTP, WebSocket, anything else) passes through untouched.
//!
//! # Architecture
//!
//! ```text
//! Client  <--TCP-->  tcp-forward  <--TCP-->  Upstream
//! ```
//!
//! Every accepted connection gets exactly one fresh upstream connection. The
//! two directions of a session are copied concurrently; end-of-stream on one
//! side half-closes the other, and an error on either side tears the whole
//! session down.

pub mod listener;
pub mod relay;

pub use listener::{BoundForwarder, ForwardConfig, Forwarder};
pub use relay::{relay, RelayStats};

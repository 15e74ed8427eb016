//! HTTP gateway for the remote-gateway project.
//!
//! The gateway is the public entry point browsers talk to. It forwards every
//! request to a fixed upstream origin (the agent's local web server), then
//! adapts the response for a phone-sized browser:
//!
//! ```text
//! Browser  <--HTTP-->  http-gateway  <--HTTP-->  Upstream origin
//!                          |
//!                   [Rewrite rules]
//! ```
//!
//! Responses whose content type matches a [`RewriteRule`] are rewritten in
//! flight; the built-in [`MobileViewportRule`] injects a viewport meta tag
//! and responsive CSS into HTML pages. Every response carries a permissive
//! `Access-Control-Allow-Origin` header, and nothing is cached.

pub mod error;
pub mod rewrite;
pub mod server;

pub use error::GatewayError;
pub use rewrite::{MobileViewportRule, RewriteOutcome, RewriteRule};
pub use server::{BoundGateway, Gateway, GatewayConfig, StaticRoute};

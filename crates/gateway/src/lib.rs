//! Gateway: the HTTP/WebSocket surface that embodies agents as a chat
//! stream, a tool-calling endpoint and a realtime voice relay.
//!
//! Every embodiment request goes through the same pipeline:
//! 1. Admission (sliding-window rate and per-client concurrency)
//! 2. Agent context resolution (identity, version, test channel)
//! 3. The protocol bridge for the route
//!
//! Agents, secrets and speech plumbing live in their own crates and are
//! injected through [`state::GatewayState`].

pub mod auth;
pub mod chat;
pub mod context;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod state;
pub mod tools;
pub mod voice;

#[cfg(test)]
mod test_support;

pub use {
    error::GatewayError,
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};

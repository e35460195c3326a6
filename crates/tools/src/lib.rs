//! Capability description adapter: turns an Agent's capability spec into
//! tool descriptors for the tool-calling and realtime voice protocols.

pub mod adapter;
pub mod naming;
pub mod schema;

pub use {
    adapter::{Protocol, find_operation, to_tool_descriptors},
    naming::tool_name,
};

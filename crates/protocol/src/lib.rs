//! Wire types shared by the embodiment bridges: JSON-RPC frames for the
//! tool-calling protocol, tool descriptors and call results, and chat
//! stream request/chunk shapes.

pub mod chat;
pub mod jsonrpc;
pub mod tools;

pub use {
    chat::{Attachment, ChatChunk, ChatRequest},
    jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, error_codes},
    tools::{ContentBlock, ToolCallParams, ToolCallResult, ToolDescriptor},
};

/// Tool-calling protocol revision advertised in `initialize`.
pub const TOOL_PROTOCOL_VERSION: &str = "2024-11-05";

/// Request headers understood by the gateway.
pub mod headers {
    pub const AGENT_ID: &str = "x-agent-id";
    pub const AGENT_VERSION: &str = "x-agent-version";
    pub const DEBUG: &str = "x-debug";
    pub const CONVERSATION_ID: &str = "x-conversation-id";
    pub const MONITOR_ID: &str = "x-monitor-id";
    pub const FORWARDED_FOR: &str = "x-forwarded-for";
}

//! Agent-side contracts: the capability spec model, the invocation contract
//! consumed by every embodiment, and the directory that maps requests to
//! deployed agents.

pub mod call;
pub mod context;
pub mod directory;
pub mod ingestion;
pub mod runtime;
pub mod spec;

pub use {
    call::{AgentCall, CallError},
    context::{AgentContext, RequestMeta},
    directory::{AgentDirectory, AgentRecord, StaticAgentDirectory},
    runtime::{AgentRuntime, ChunkStream, HttpAgentRuntime, InvokeError},
    spec::{CapabilitySpec, Method, Operation, OperationRef},
};

use std::sync::Arc;

use crate::{directory::AgentRecord, spec::CapabilitySpec};

/// Per-request caller metadata forwarded to the Agent runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMeta {
    pub conversation_id: Option<String>,
    pub monitor_id: Option<String>,
    pub bearer_token: Option<String>,
}

/// The resolved execution context of one request. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent: Arc<AgentRecord>,
    /// Deployed version, or `None` for the draft configuration.
    pub version: Option<String>,
    /// Hostname the request arrived on.
    pub domain: String,
    /// Sandboxed execution against draft configuration.
    pub is_test_channel: bool,
    /// Capability spec for this request; may differ from `agent.spec` when
    /// default capabilities were injected.
    pub spec: Arc<CapabilitySpec>,
    pub meta: RequestMeta,
}

impl AgentContext {
    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }
}

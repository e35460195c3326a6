use std::sync::Arc;

use {
    embody_agents::{AgentDirectory, AgentRuntime},
    embody_config::EmbodyConfig,
    embody_vault::SecretBroker,
    embody_voice::{OpenAiRealtime, RealtimeConnector},
};

use crate::{
    context::AgentContextResolver, rate_limit::RateAdmission, registry::ConnectionRegistry,
    tools::ToolSessionHandle, voice::VoiceRelay,
};

/// Shared gateway runtime state, wrapped in Arc for use across handlers.
pub struct GatewayState {
    pub config: Arc<EmbodyConfig>,
    /// Server version string.
    pub version: String,
    pub resolver: AgentContextResolver,
    pub runtime: Arc<dyn AgentRuntime>,
    pub vault: Arc<SecretBroker>,
    pub admission: Arc<RateAdmission>,
    /// Open tool-calling sessions, keyed by session id.
    pub tool_sessions: ConnectionRegistry<ToolSessionHandle>,
    /// Mints ephemeral keys for voice sessions.
    pub realtime: Arc<OpenAiRealtime>,
    pub voice: VoiceRelay,
}

impl GatewayState {
    pub fn new(
        config: EmbodyConfig,
        directory: Arc<dyn AgentDirectory>,
        runtime: Arc<dyn AgentRuntime>,
        vault: Arc<SecretBroker>,
        realtime: Arc<OpenAiRealtime>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Arc<Self> {
        let resolver = AgentContextResolver::new(directory, &config.server.sandbox_domain);
        let admission = Arc::new(RateAdmission::new(config.rate_limit.clone()));
        let voice = VoiceRelay::new(connector, Arc::clone(&runtime), &config.voice.voice);

        Arc::new(Self {
            config: Arc::new(config),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resolver,
            runtime,
            vault,
            admission,
            tool_sessions: ConnectionRegistry::new(),
            realtime,
            voice,
        })
    }
}

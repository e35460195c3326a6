//! Config schema types (server, rate limits, agents, runtime, vault, voice).

use std::{collections::HashMap, path::PathBuf};

use {secrecy::Secret, serde::Deserialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbodyConfig {
    pub server: ServerConfig,
    pub rate_limit: RateLimitConfig,
    /// Agents served by this gateway.
    pub agents: Vec<AgentEntry>,
    pub runtime: RuntimeConfig,
    pub vault: VaultConfig,
    pub voice: VoiceConfig,
}

/// Listener and request-routing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Domain whose hosts run agents in the sandbox (test) channel.
    pub sandbox_domain: String,
    /// Use the first `X-Forwarded-For` entry as the client address.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            sandbox_domain: "agent.embody.dev".into(),
            trust_forwarded_for: false,
        }
    }
}

/// Sliding-window and concurrency admission limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per client in any trailing 60s window. `0` disables.
    pub requests_per_minute: u32,
    /// In-flight requests allowed per client. `0` disables.
    pub max_concurrent_requests: u32,
    /// Address prefixes that bypass admission entirely.
    pub exempt_prefixes: Vec<String>,
    pub sweep_interval_secs: u64,
    /// Idle time after which a concurrency slot is considered stale.
    pub slot_ttl_secs: u64,
    /// Deny instead of admitting when the limiter itself fails.
    pub fail_closed: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 300,
            max_concurrent_requests: 10,
            exempt_prefixes: vec![
                "127.".into(),
                "::1".into(),
                "10.".into(),
                "192.168.".into(),
                "172.16.".into(),
                "::ffff:127.".into(),
            ],
            sweep_interval_secs: 300,
            slot_ttl_secs: 600,
            fail_closed: false,
        }
    }
}

/// One agent served by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentEntry {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Owning team; scopes every vault lookup made on behalf of this agent.
    pub team_id: String,
    /// Hostnames that resolve to this agent.
    pub domains: Vec<String>,
    /// Agent authenticates its own callers; voice and tool protocols are refused.
    pub custom_auth: bool,
    /// A debug session is currently attached to the agent.
    pub debug_session: bool,
    /// Path to the capability spec (JSON or YAML).
    pub spec_path: Option<PathBuf>,
    /// Inline capability spec, used when `spec_path` is unset.
    pub spec: Option<serde_json::Value>,
}

/// Where the Agent execution engine lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5053".into(),
            timeout_secs: 300,
        }
    }
}

/// Secret store endpoint and machine-to-machine credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub url: String,
    /// OAuth token endpoint for the client-credentials grant.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<Secret<String>>,
    pub scope: Option<String>,
    /// Deprecated global key names, lowercase request name -> stored name.
    pub legacy_aliases: HashMap<String, String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5054".into(),
            token_url: "http://127.0.0.1:5054/oauth/token".into(),
            client_id: "embody-gateway".into(),
            client_secret: None,
            scope: None,
            legacy_aliases: HashMap::from([("anthropic".into(), "claude".into())]),
        }
    }
}

/// Realtime speech provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub api_base: String,
    pub realtime_url: String,
    pub model: String,
    pub voice: String,
    /// Vault key holding the provider API key.
    pub provider_key: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            realtime_url: "wss://api.openai.com/v1/realtime".into(),
            model: "gpt-4o-realtime-preview".into(),
            voice: "alloy".into(),
            provider_key: "openai".into(),
        }
    }
}

impl EmbodyConfig {
    /// Look up a configured agent by id.
    pub fn agent(&self, id: &str) -> Option<&AgentEntry> {
        self.agents.iter().find(|a| a.id == id)
    }
}

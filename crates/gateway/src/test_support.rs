//! Shared fakes for gateway tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    futures::StreamExt,
    secrecy::Secret,
    serde_json::{Value, json},
    tokio_util::sync::CancellationToken,
};

use {
    embody_agents::{
        AgentCall, AgentContext, AgentRecord, AgentRuntime, CapabilitySpec, ChunkStream,
        InvokeError, RequestMeta, StaticAgentDirectory,
    },
    embody_config::EmbodyConfig,
    embody_protocol::ChatChunk,
    embody_vault::{SecretBroker, SecretRef, SecretScope, SecretStore, VaultError},
    embody_voice::OpenAiRealtime,
};

use crate::state::GatewayState;

/// Echoes invocations back and streams canned chat chunks.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    pub chunks: Vec<String>,
    /// Upstream status to fail with once `chunks` are exhausted.
    pub fail_with: Option<u16>,
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn invoke(
        &self,
        _ctx: &AgentContext,
        call: AgentCall,
        _cancel: CancellationToken,
    ) -> Result<Value, InvokeError> {
        if let Some(status) = self.fail_with {
            return Err(InvokeError::Status {
                status,
                body: "boom".into(),
            });
        }
        Ok(json!({
            "method": call.method.as_str(),
            "path": call.path,
            "query": call.query,
            "body": call.body,
        }))
    }

    fn chat_stream(
        &self,
        _ctx: &AgentContext,
        _message: String,
        _cancel: CancellationToken,
    ) -> ChunkStream {
        let mut items: Vec<Result<ChatChunk, InvokeError>> =
            self.chunks.iter().map(|c| Ok(ChatChunk::content(c.clone()))).collect();
        if let Some(status) = self.fail_with {
            items.push(Err(InvokeError::Status {
                status,
                body: "boom".into(),
            }));
        }
        Box::pin(futures::stream::iter(items))
    }
}

/// Streams one chunk and then stalls, keeping the cancel token it was given.
#[derive(Debug, Default)]
pub struct StallingRuntime {
    pub cancel: Mutex<Option<CancellationToken>>,
}

impl StallingRuntime {
    pub fn token(&self) -> Option<CancellationToken> {
        self.cancel.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for StallingRuntime {
    async fn invoke(
        &self,
        _ctx: &AgentContext,
        _call: AgentCall,
        _cancel: CancellationToken,
    ) -> Result<Value, InvokeError> {
        Ok(Value::Null)
    }

    fn chat_stream(
        &self,
        _ctx: &AgentContext,
        _message: String,
        cancel: CancellationToken,
    ) -> ChunkStream {
        *self.cancel.lock().unwrap() = Some(cancel);
        Box::pin(
            futures::stream::once(async { Ok(ChatChunk::content("first".to_string())) })
                .chain(futures::stream::pending()),
        )
    }
}

/// Team-scoped secrets held in memory, keyed by name.
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: HashMap<(String, String), String>,
}

impl MemoryStore {
    pub fn with(mut self, team: &str, name: &str, value: &str) -> Self {
        self.secrets
            .insert((team.to_string(), name.to_string()), value.to_string());
        self
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn fetch_by_id(
        &self,
        _scope: &SecretScope,
        _key_id: &str,
    ) -> Result<Option<Secret<String>>, VaultError> {
        Ok(None)
    }

    async fn fetch_by_name(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<Secret<String>>, VaultError> {
        Ok(self
            .secrets
            .get(&(scope.team_id.clone(), name.to_string()))
            .map(|v| Secret::new(v.clone())))
    }

    async fn list(&self, scope: &SecretScope) -> Result<Vec<SecretRef>, VaultError> {
        Ok(self
            .secrets
            .keys()
            .filter(|(team, _)| *team == scope.team_id)
            .map(|(_, name)| SecretRef {
                id: name.clone(),
                name: name.clone(),
            })
            .collect())
    }
}

/// One GET /search operation with a required `q` query parameter.
pub fn spec_with_search() -> Arc<CapabilitySpec> {
    let spec = CapabilitySpec::parse(
        r#"{
            "info": {"title": "Search", "description": "Finds things."},
            "paths": {
                "/search": {
                    "get": {
                        "operationId": "search",
                        "summary": "Search the catalogue",
                        "parameters": [
                            {"name": "q", "in": "query", "required": true, "schema": {"type": "string"}}
                        ]
                    }
                }
            }
        }"#,
    )
    .unwrap();
    Arc::new(spec)
}

pub fn agent_record(spec: Arc<CapabilitySpec>) -> AgentRecord {
    AgentRecord {
        id: "A".into(),
        name: "Agent A".into(),
        description: None,
        team_id: "T".into(),
        domains: vec!["a.example.com".into()],
        custom_auth: false,
        debug_session: false,
        spec,
    }
}

pub fn context_for(spec: Arc<CapabilitySpec>) -> AgentContext {
    AgentContext {
        agent: Arc::new(agent_record(Arc::clone(&spec))),
        version: None,
        domain: "localhost".into(),
        is_test_channel: true,
        spec,
        meta: RequestMeta::default(),
    }
}

/// Gateway state over one agent "A", in-memory secrets and a fake runtime.
pub fn test_state(
    config: EmbodyConfig,
    runtime: Arc<dyn AgentRuntime>,
    store: MemoryStore,
) -> Arc<GatewayState> {
    let mut directory = StaticAgentDirectory::default();
    directory.insert(agent_record(spec_with_search()));
    let directory = Arc::new(directory);
    let vault = Arc::new(SecretBroker::new(
        Arc::new(store),
        directory.clone(),
        HashMap::new(),
    ));
    let realtime = Arc::new(OpenAiRealtime::new(
        reqwest::Client::new(),
        config.voice.clone(),
    ));
    GatewayState::new(config, directory, runtime, vault, realtime.clone(), realtime)
}

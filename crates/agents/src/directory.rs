//! Agent directory: where agent metadata and capability specs come from.

use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Context,
    async_trait::async_trait,
    tracing::{debug, info},
};

use embody_config::AgentEntry;

use crate::spec::CapabilitySpec;

/// A deployed agent as the gateway sees it.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub team_id: String,
    pub domains: Vec<String>,
    pub custom_auth: bool,
    pub debug_session: bool,
    pub spec: Arc<CapabilitySpec>,
}

impl AgentRecord {
    /// Human-facing description: configured, else the spec's own.
    pub fn display_description(&self) -> Option<&str> {
        self.description
            .as_deref()
            .or(self.spec.info.description.as_deref())
    }
}

/// Lookup of agents by id and by serving hostname.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent(&self, id: &str) -> Option<Arc<AgentRecord>>;

    /// Reverse lookup of the agent served on `host`.
    async fn agent_for_domain(&self, host: &str) -> Option<String>;

    async fn team_of(&self, agent_id: &str) -> Option<String> {
        self.agent(agent_id).await.map(|a| a.team_id.clone())
    }
}

/// Directory built once from the config file.
#[derive(Debug, Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<String, Arc<AgentRecord>>,
    by_domain: HashMap<String, String>,
}

impl StaticAgentDirectory {
    pub fn from_entries(entries: &[AgentEntry]) -> anyhow::Result<Self> {
        let mut directory = Self::default();
        for entry in entries {
            let spec = match (&entry.spec_path, &entry.spec) {
                (Some(path), _) => CapabilitySpec::load(path)?,
                (None, Some(inline)) => serde_json::from_value(inline.clone())
                    .with_context(|| format!("invalid inline spec for agent {}", entry.id))?,
                (None, None) => CapabilitySpec::default(),
            };
            debug!(agent_id = %entry.id, operations = spec.operations().count(), "loaded agent");
            directory.insert(AgentRecord {
                id: entry.id.clone(),
                name: if entry.name.is_empty() {
                    entry.id.clone()
                } else {
                    entry.name.clone()
                },
                description: entry.description.clone(),
                team_id: entry.team_id.clone(),
                domains: entry.domains.clone(),
                custom_auth: entry.custom_auth,
                debug_session: entry.debug_session,
                spec: Arc::new(spec),
            });
        }
        info!(count = directory.agents.len(), "agent directory ready");
        Ok(directory)
    }

    pub fn insert(&mut self, record: AgentRecord) {
        for domain in &record.domains {
            self.by_domain
                .insert(domain.to_lowercase(), record.id.clone());
        }
        self.agents.insert(record.id.clone(), Arc::new(record));
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn agent(&self, id: &str) -> Option<Arc<AgentRecord>> {
        self.agents.get(id).cloned()
    }

    async fn agent_for_domain(&self, host: &str) -> Option<String> {
        self.by_domain.get(&host.to_lowercase()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_from_inline_entries() {
        let entries = vec![AgentEntry {
            id: "a1".into(),
            team_id: "t1".into(),
            domains: vec!["Bot.Example.com".into()],
            spec: Some(serde_json::json!({
                "info": {"title": "Bot", "description": "Answers questions"},
                "paths": {"/ask": {"post": {}}}
            })),
            ..AgentEntry::default()
        }];

        let directory = StaticAgentDirectory::from_entries(&entries).unwrap();
        let agent = directory.agent("a1").await.unwrap();
        assert_eq!(agent.name, "a1");
        assert_eq!(agent.display_description(), Some("Answers questions"));
        assert_eq!(
            directory.agent_for_domain("bot.example.com").await.as_deref(),
            Some("a1")
        );
        assert_eq!(directory.team_of("a1").await.as_deref(), Some("t1"));
        assert!(directory.agent("missing").await.is_none());
    }

    #[test]
    fn loads_spec_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.yaml");
        std::fs::write(&path, "paths:\n  /ping:\n    get: {}\n").unwrap();

        let entries = vec![AgentEntry {
            id: "a2".into(),
            spec_path: Some(path),
            ..AgentEntry::default()
        }];
        let directory = StaticAgentDirectory::from_entries(&entries).unwrap();
        assert_eq!(directory.len(), 1);
    }
}

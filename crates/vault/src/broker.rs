//! Secret lookup on behalf of an agent or team.

use std::{collections::HashMap, sync::Arc};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use {
    crate::{
        acl::Permission,
        error::VaultError,
        store::{HttpSecretStore, SecretRef, SecretScope, SecretStore},
        token::ClientCredentialsTokenProvider,
    },
    embody_agents::AgentDirectory,
    embody_config::VaultConfig,
};

/// Who is asking for a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCandidate {
    Agent(String),
    Team(String),
}

#[derive(Debug, Clone, Copy)]
enum Lookup<'a> {
    Id(&'a str),
    Name(&'a str),
}

pub struct SecretBroker {
    store: Arc<dyn SecretStore>,
    directory: Arc<dyn AgentDirectory>,
    /// Lowercase requested name -> stored name.
    legacy_aliases: HashMap<String, String>,
}

impl SecretBroker {
    pub fn new(
        store: Arc<dyn SecretStore>,
        directory: Arc<dyn AgentDirectory>,
        legacy_aliases: HashMap<String, String>,
    ) -> Self {
        let legacy_aliases = legacy_aliases
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            store,
            directory,
            legacy_aliases,
        }
    }

    /// Broker backed by the HTTP secret store and client-credentials tokens.
    pub fn from_config(
        client: reqwest::Client,
        config: &VaultConfig,
        directory: Arc<dyn AgentDirectory>,
    ) -> Self {
        let tokens = Arc::new(ClientCredentialsTokenProvider::new(client.clone(), config));
        let store = Arc::new(HttpSecretStore::new(client, &config.url, tokens));
        Self::new(store, directory, config.legacy_aliases.clone())
    }

    /// The candidate's own namespace. Built from the candidate's team, so it
    /// is always one the team owns.
    async fn scope_for(&self, candidate: &AccessCandidate) -> Result<SecretScope, VaultError> {
        let team_id = match candidate {
            AccessCandidate::Team(team) => team.clone(),
            AccessCandidate::Agent(agent_id) => self
                .directory
                .team_of(agent_id)
                .await
                .ok_or_else(|| VaultError::UnknownCandidate(agent_id.clone()))?,
        };
        Ok(SecretScope::new(team_id))
    }

    /// Look `key` up in the candidate's own namespace.
    pub async fn get(
        &self,
        key: &str,
        candidate: &AccessCandidate,
    ) -> Result<Option<Secret<String>>, VaultError> {
        let scope = self.scope_for(candidate).await?;
        self.lookup(&scope, key).await
    }

    /// Look `key` up in `requested`, which the candidate's team must be
    /// allowed to read. Fails with `Forbidden` before touching the store
    /// otherwise.
    pub async fn get_in(
        &self,
        requested: &SecretScope,
        key: &str,
        candidate: &AccessCandidate,
    ) -> Result<Option<Secret<String>>, VaultError> {
        let own = self.scope_for(candidate).await?;
        requested.authorize(&own.team_id, Permission::Read)?;
        self.lookup(requested, key).await
    }

    /// Try `key` by id, then by name, then through the legacy alias table.
    /// `Ok(None)` when every attempt missed.
    async fn lookup(
        &self,
        scope: &SecretScope,
        key: &str,
    ) -> Result<Option<Secret<String>>, VaultError> {
        let mut chain = vec![Lookup::Id(key), Lookup::Name(key)];
        if let Some(alias) = self.legacy_aliases.get(&key.to_lowercase()) {
            chain.push(Lookup::Name(alias));
        }

        let mut answered = false;
        let mut last_err = None;
        for lookup in chain {
            let result = match lookup {
                Lookup::Id(id) => self.store.fetch_by_id(scope, id).await,
                Lookup::Name(name) => self.store.fetch_by_name(scope, name).await,
            };
            match result {
                Ok(Some(value)) => {
                    debug!(team_id = %scope.team_id, ?lookup, "secret resolved");
                    return Ok(Some(value));
                },
                Ok(None) => answered = true,
                Err(e) => {
                    warn!(team_id = %scope.team_id, ?lookup, error = %e, "secret lookup failed, trying next");
                    last_err = Some(e);
                },
            }
        }

        match last_err {
            Some(e) if !answered => Err(VaultError::Unreachable(e.to_string())),
            _ => Ok(None),
        }
    }

    pub async fn exists(&self, key: &str, candidate: &AccessCandidate) -> Result<bool, VaultError> {
        Ok(self.get(key, candidate).await?.is_some())
    }

    pub async fn list_keys(&self, candidate: &AccessCandidate) -> Result<Vec<SecretRef>, VaultError> {
        let scope = self.scope_for(candidate).await?;
        self.store.list(&scope).await
    }
}

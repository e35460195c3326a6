//! Secret store client.

use std::sync::Arc;

use {
    async_trait::async_trait,
    reqwest::StatusCode,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::{debug, trace},
};

use crate::{
    acl::{Acl, Permission},
    error::VaultError,
    token::TokenProvider,
};

/// One team's secret namespace. Every store call is scoped to exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretScope {
    pub team_id: String,
}

impl SecretScope {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
        }
    }

    pub fn acl(&self) -> Acl {
        Acl::owned_by(&self.team_id)
    }

    /// Fails unless `team_id` holds `permission` on this scope.
    pub fn authorize(&self, team_id: &str, permission: Permission) -> Result<(), VaultError> {
        if self.acl().permits(team_id, permission) {
            Ok(())
        } else {
            Err(VaultError::Forbidden(self.team_id.clone()))
        }
    }
}

/// Reference to a stored secret, without its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the store answered and has no such secret.
    async fn fetch_by_id(
        &self,
        scope: &SecretScope,
        key_id: &str,
    ) -> Result<Option<Secret<String>>, VaultError>;

    async fn fetch_by_name(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<Secret<String>>, VaultError>;

    async fn list(&self, scope: &SecretScope) -> Result<Vec<SecretRef>, VaultError>;
}

// ── HTTP store ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SecretPayload {
    value: Secret<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListPayload {
    Bare(Vec<SecretRef>),
    Wrapped { secrets: Vec<SecretRef> },
}

/// Secret store over HTTP, with a fresh bearer token on every call.
pub struct HttpSecretStore {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpSecretStore {
    pub fn new(client: reqwest::Client, base_url: &str, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn secrets_url(&self, scope: &SecretScope) -> String {
        format!(
            "{}/vault/{}/secrets",
            self.base_url,
            urlencoding::encode(&scope.team_id)
        )
    }

    async fn get(&self, url: String) -> Result<Option<reqwest::Response>, VaultError> {
        let token = self.tokens.token().await?;
        trace!(%url, "secret store request");
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp)),
            s => Err(VaultError::Status { status: s.as_u16() }),
        }
    }

    async fn fetch(&self, url: String) -> Result<Option<Secret<String>>, VaultError> {
        match self.get(url).await? {
            Some(resp) => {
                let payload: SecretPayload = resp.json().await?;
                Ok(Some(payload.value))
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    async fn fetch_by_id(
        &self,
        scope: &SecretScope,
        key_id: &str,
    ) -> Result<Option<Secret<String>>, VaultError> {
        let url = format!("{}/{}", self.secrets_url(scope), urlencoding::encode(key_id));
        self.fetch(url).await
    }

    async fn fetch_by_name(
        &self,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<Secret<String>>, VaultError> {
        let url = format!("{}/name/{}", self.secrets_url(scope), urlencoding::encode(name));
        self.fetch(url).await
    }

    async fn list(&self, scope: &SecretScope) -> Result<Vec<SecretRef>, VaultError> {
        let Some(resp) = self.get(self.secrets_url(scope)).await? else {
            return Ok(Vec::new());
        };
        let refs = match resp.json::<ListPayload>().await? {
            ListPayload::Bare(refs) | ListPayload::Wrapped { secrets: refs } => refs,
        };
        debug!(team_id = %scope.team_id, count = refs.len(), "listed secrets");
        Ok(refs)
    }
}

//! Machine-to-machine tokens for the secret store.

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::debug,
};

use {crate::error::VaultError, embody_config::VaultConfig};

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A bearer token valid for one store call. Implementations must not
    /// reuse tokens across calls.
    async fn token(&self) -> Result<Secret<String>, VaultError>;
}

/// OAuth2 client-credentials grant against the configured token endpoint.
pub struct ClientCredentialsTokenProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<Secret<String>>,
    scope: Option<String>,
}

impl std::fmt::Debug for ClientCredentialsTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsTokenProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Secret<String>,
}

impl ClientCredentialsTokenProvider {
    pub fn new(client: reqwest::Client, config: &VaultConfig) -> Self {
        Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
        }
    }
}

#[async_trait]
impl TokenProvider for ClientCredentialsTokenProvider {
    async fn token(&self) -> Result<Secret<String>, VaultError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose_secret().as_str()));
        }
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.as_str()));
        }

        let resp = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| VaultError::Token(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(VaultError::Token(format!("HTTP {status}")));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::Token(e.to_string()))?;
        debug!(client_id = %self.client_id, "fetched secret store token");
        Ok(body.access_token)
    }
}

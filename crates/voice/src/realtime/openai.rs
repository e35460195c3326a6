//! OpenAI Realtime: ephemeral session keys and the upstream WebSocket.

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::sync::mpsc,
    tokio_tungstenite::tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
    tracing::{debug, info, warn},
};

use {
    super::{RealtimeConnector, RealtimeSocket, UpstreamEvent},
    crate::error::VoiceError,
    embody_config::VoiceConfig,
};

/// A short-lived client credential for one realtime session.
#[derive(Debug, Clone)]
pub struct EphemeralKey {
    pub value: Secret<String>,
    /// Unix seconds.
    pub expires_at: i64,
    pub model: String,
}

#[derive(Deserialize)]
struct SessionResponse {
    client_secret: ClientSecret,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: Secret<String>,
    expires_at: i64,
}

#[derive(Clone)]
pub struct OpenAiRealtime {
    client: reqwest::Client,
    config: VoiceConfig,
}

impl std::fmt::Debug for OpenAiRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiRealtime")
            .field("api_base", &self.config.api_base)
            .field("model", &self.config.model)
            .finish()
    }
}

impl OpenAiRealtime {
    pub fn new(client: reqwest::Client, config: VoiceConfig) -> Self {
        Self { client, config }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn voice(&self) -> &str {
        &self.config.voice
    }

    /// Mint an ephemeral key with the team's provider API key.
    pub async fn mint_ephemeral_key(
        &self,
        api_key: &Secret<String>,
    ) -> Result<EphemeralKey, VoiceError> {
        let url = format!(
            "{}/realtime/sessions",
            self.config.api_base.trim_end_matches('/')
        );
        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key.expose_secret())
            .json(&serde_json::json!({
                "model": self.config.model,
                "voice": self.config.voice,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "ephemeral key request rejected");
            return Err(VoiceError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let session: SessionResponse = resp.json().await?;
        debug!(expires_at = session.client_secret.expires_at, "minted ephemeral key");
        Ok(EphemeralKey {
            value: session.client_secret.value,
            expires_at: session.client_secret.expires_at,
            model: session.model.unwrap_or_else(|| self.config.model.clone()),
        })
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiRealtime {
    async fn connect(
        &self,
        call_id: &str,
        ephemeral_key: &Secret<String>,
    ) -> Result<RealtimeSocket, VoiceError> {
        let url = format!(
            "{}?call_id={}",
            self.config.realtime_url,
            urlencoding::encode(call_id)
        );
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", ephemeral_key.expose_secret()))
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| VoiceError::Connect(e.to_string()))?;
        info!(call_id, "realtime socket open");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let call = call_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(UpstreamEvent::Message(text.to_string())).is_err() {
                            return;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {},
                    Err(e) => {
                        warn!(call_id = %call, error = %e, "realtime socket error");
                        let _ = in_tx.send(UpstreamEvent::Error(e.to_string()));
                        return;
                    },
                }
            }
            let _ = in_tx.send(UpstreamEvent::Closed);
        });

        Ok(RealtimeSocket {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

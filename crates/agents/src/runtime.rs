//! The Agent invocation contract and its HTTP implementation.

use std::{pin::Pin, time::Duration};

use {
    async_trait::async_trait,
    futures::StreamExt,
    serde_json::Value,
    tokio_stream::Stream,
    tokio_util::sync::CancellationToken,
    tracing::{debug, trace, warn},
};

use embody_protocol::{ChatChunk, headers};

use crate::{call::AgentCall, context::AgentContext};

/// Path on the runtime that accepts streamed chat turns.
pub const CHAT_PATH: &str = "/_embody/chat";

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, InvokeError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("invocation cancelled")]
    Cancelled,
    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("agent runtime unreachable: {0}")]
    Transport(String),
    #[error("invalid agent response: {0}")]
    Decode(String),
}

impl InvokeError {
    /// Short machine-readable kind, used as `errorType` in chat chunks.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::Cancelled => "cancelled",
            InvokeError::Status { .. } => "agent_error",
            InvokeError::Transport(_) => "upstream_unavailable",
            InvokeError::Decode(_) => "invalid_response",
        }
    }
}

/// External Agent execution engine.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Execute one operation and return its result.
    async fn invoke(
        &self,
        ctx: &AgentContext,
        call: AgentCall,
        cancel: CancellationToken,
    ) -> Result<Value, InvokeError>;

    /// Run one chat turn, yielding output chunks in production order. The
    /// stream stops once `cancel` fires.
    fn chat_stream(
        &self,
        ctx: &AgentContext,
        message: String,
        cancel: CancellationToken,
    ) -> ChunkStream;
}

// ── HTTP runtime ─────────────────────────────────────────────────────────────

pub struct HttpAgentRuntime {
    client: reqwest::Client,
    base_url: String,
    /// Whole-request limit for `invoke`; idle limit between chat chunks.
    timeout: Duration,
}

impl HttpAgentRuntime {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // No client-wide timeout: it would also bound streamed chat bodies.
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn request(&self, ctx: &AgentContext, method: &str, path: &str) -> reqwest::RequestBuilder {
        let method =
            reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(headers::AGENT_ID, ctx.agent_id());
        if let Some(version) = &ctx.version {
            req = req.header(headers::AGENT_VERSION, version);
        }
        if ctx.is_test_channel {
            req = req.header(headers::DEBUG, "true");
        }
        if let Some(id) = &ctx.meta.conversation_id {
            req = req.header(headers::CONVERSATION_ID, id);
        }
        if let Some(id) = &ctx.meta.monitor_id {
            req = req.header(headers::MONITOR_ID, id);
        }
        if let Some(token) = &ctx.meta.bearer_token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn invoke(
        &self,
        ctx: &AgentContext,
        call: AgentCall,
        cancel: CancellationToken,
    ) -> Result<Value, InvokeError> {
        debug!(agent_id = %ctx.agent_id(), method = %call.method, path = %call.path, "invoking agent");

        let mut req = self
            .request(ctx, call.method.as_str(), &call.path)
            .timeout(self.timeout)
            .query(&call.query);
        if let Some(body) = &call.body {
            req = req.json(body);
        }

        let send = async {
            let resp = req
                .send()
                .await
                .map_err(|e| InvokeError::Transport(e.to_string()))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| InvokeError::Transport(e.to_string()))?;
            if !status.is_success() {
                return Err(InvokeError::Status {
                    status: status.as_u16(),
                    body: text,
                });
            }
            Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvokeError::Cancelled),
            result = send => result,
        }
    }

    fn chat_stream(
        &self,
        ctx: &AgentContext,
        message: String,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let req = self.request(ctx, "POST", CHAT_PATH).json(&serde_json::json!({
            "message": message,
            "stream": true,
        }));
        let agent_id = ctx.agent_id().to_string();
        let idle_timeout = self.timeout;

        Box::pin(async_stream::stream! {
            let resp = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                resp = tokio::time::timeout(idle_timeout, req.send()) => resp,
            };
            let resp = match resp {
                Ok(Ok(r)) if r.status().is_success() => r,
                Ok(Ok(r)) => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    yield Err(InvokeError::Status { status, body });
                    return;
                },
                Ok(Err(e)) => {
                    yield Err(InvokeError::Transport(e.to_string()));
                    return;
                },
                Err(_) => {
                    yield Err(InvokeError::Transport("agent did not answer the chat turn".into()));
                    return;
                },
            };

            let mut bytes = resp.bytes_stream();
            let mut lines = LineBuffer::default();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(%agent_id, "chat stream cancelled");
                        return;
                    },
                    next = tokio::time::timeout(idle_timeout, bytes.next()) => next,
                };
                let Ok(next) = next else {
                    yield Err(InvokeError::Transport(format!(
                        "no output from agent for {idle_timeout:?}"
                    )));
                    return;
                };
                let Some(chunk) = next else {
                    break;
                };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(InvokeError::Transport(e.to_string()));
                        return;
                    },
                };

                for line in lines.push(&chunk) {
                    match line {
                        Ok(line) => {
                            if let Some(parsed) = parse_chunk_line(&line) {
                                yield parsed;
                            }
                        },
                        Err(e) => yield Err(e),
                    }
                }
            }
            match lines.finish() {
                Ok(Some(rest)) => {
                    if let Some(parsed) = parse_chunk_line(&rest) {
                        yield parsed;
                    }
                },
                Ok(None) => {},
                Err(e) => yield Err(e),
            }
        })
    }
}

/// Splits a byte stream into UTF-8 lines. Bytes are held until a newline
/// arrives, so a character split across network chunks decodes intact.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append `bytes` and return every line they complete.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, InvokeError>> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(line));
        }
        lines
    }

    /// The unterminated tail, if any.
    fn finish(self) -> Result<Option<String>, InvokeError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        decode_line(self.pending).map(Some)
    }
}

fn decode_line(line: Vec<u8>) -> Result<String, InvokeError> {
    String::from_utf8(line)
        .map_err(|e| InvokeError::Decode(format!("invalid UTF-8 in chat stream: {e}")))
}

/// Parse one NDJSON (or SSE `data:`) line from the runtime's chat stream.
fn parse_chunk_line(line: &str) -> Option<Result<ChatChunk, InvokeError>> {
    let line = line.trim();
    let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    trace!(raw = %data, "agent chunk");
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => Some(Ok(chunk)),
        Err(e) => {
            warn!(error = %e, "undecodable chat chunk");
            Some(Err(InvokeError::Decode(e.to_string())))
        },
    }
}

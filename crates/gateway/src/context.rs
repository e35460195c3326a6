//! Request → `AgentContext` resolution.

use std::sync::Arc;

use {
    axum::http::{HeaderMap, header::HOST},
    tracing::debug,
};

use {
    embody_agents::{AgentContext, AgentDirectory, RequestMeta, ingestion::with_file_ingestion},
    embody_protocol::headers,
};

use crate::{
    auth::{bearer_token, is_loopback_host},
    error::GatewayError,
};

/// Version assigned to production traffic that names no version.
pub const LATEST_VERSION: &str = "latest";

/// The parts of a request that identify the target agent.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub headers: &'a HeaderMap,
    pub path: &'a str,
    /// `model` field of the body, for LLM-compatible callers.
    pub model: Option<&'a str>,
    /// Chat request carrying attachments.
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentitySource {
    Header,
    Model,
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    agent_id: String,
    version: Option<String>,
    source: IdentitySource,
}

pub struct AgentContextResolver {
    directory: Arc<dyn AgentDirectory>,
    sandbox_domain: String,
}

impl AgentContextResolver {
    pub fn new(directory: Arc<dyn AgentDirectory>, sandbox_domain: &str) -> Self {
        Self {
            directory,
            sandbox_domain: sandbox_domain.trim().to_lowercase(),
        }
    }

    pub async fn resolve(&self, req: &RequestParts<'_>) -> Result<AgentContext, GatewayError> {
        let host = request_host(req.headers);
        let identity = self.identify(req, &host).await?;
        let agent = self
            .directory
            .agent(&identity.agent_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("agent {} not found", identity.agent_id)))?;

        let sandbox = is_sandbox_host(&host, &self.sandbox_domain);
        let production = !sandbox && !is_loopback_host(&host);
        let version = identity
            .version
            .or_else(|| version_from_path(req.path))
            .or_else(|| production.then(|| LATEST_VERSION.to_string()));

        let debug_requested = req.headers.contains_key(headers::DEBUG);
        let is_test_channel =
            sandbox || is_loopback_host(&host) || (debug_requested && agent.debug_session);

        let spec = if req.has_attachments {
            with_file_ingestion(&agent.spec)
        } else {
            Arc::clone(&agent.spec)
        };

        debug!(
            agent_id = %agent.id,
            source = ?identity.source,
            version = ?version,
            is_test_channel,
            "resolved agent context"
        );

        Ok(AgentContext {
            agent,
            version,
            domain: host,
            is_test_channel,
            spec,
            meta: request_meta(req.headers),
        })
    }

    async fn identify(&self, req: &RequestParts<'_>, host: &str) -> Result<Identity, GatewayError> {
        if let Some(agent_id) = header_str(req.headers, headers::AGENT_ID) {
            let version = header_str(req.headers, headers::AGENT_VERSION)
                .or_else(|| req.model.and_then(parse_model).and_then(|(_, v)| v));
            return Ok(Identity {
                agent_id,
                version,
                source: IdentitySource::Header,
            });
        }
        if let Some((agent_id, version)) = req.model.and_then(parse_model) {
            return Ok(Identity {
                agent_id,
                version: version.or_else(|| header_str(req.headers, headers::AGENT_VERSION)),
                source: IdentitySource::Model,
            });
        }
        if !host.is_empty()
            && let Some(agent_id) = self.directory.agent_for_domain(host).await
        {
            return Ok(Identity {
                agent_id,
                version: header_str(req.headers, headers::AGENT_VERSION),
                source: IdentitySource::Hostname,
            });
        }
        Err(GatewayError::NotFound("no agent matches this request".into()))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Lowercased `Host` header without its port.
pub fn request_host(headers: &HeaderMap) -> String {
    let raw = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    strip_port(&raw).to_string()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [::1]:8080
        return host.split(']').next().map_or(host, |h| &host[..h.len() + 1]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        },
        _ => host,
    }
}

fn is_sandbox_host(host: &str, sandbox_domain: &str) -> bool {
    !sandbox_domain.is_empty()
        && (host == sandbox_domain
            || host
                .strip_suffix(sandbox_domain)
                .is_some_and(|prefix| prefix.ends_with('.')))
}

/// `<agentId>@<version>` or a bare `<agentId>`.
fn parse_model(model: &str) -> Option<(String, Option<String>)> {
    let model = model.trim();
    if model.is_empty() {
        return None;
    }
    match model.split_once('@') {
        Some((id, version)) if !id.is_empty() => Some((
            id.to_string(),
            (!version.is_empty()).then(|| version.to_string()),
        )),
        Some(_) => None,
        None => Some((model.to_string(), None)),
    }
}

/// Leading `/v<version>/` path segment, e.g. `/v2/chat/stream` → `2`.
pub fn version_from_path(path: &str) -> Option<String> {
    let segment = path.trim_start_matches('/').split('/').next()?;
    let version = segment.strip_prefix('v')?;
    version
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit())
        .then(|| version.to_string())
}

fn request_meta(headers: &HeaderMap) -> RequestMeta {
    RequestMeta {
        conversation_id: header_str(headers, headers::CONVERSATION_ID),
        monitor_id: header_str(headers, headers::MONITOR_ID),
        bearer_token: bearer_token(headers),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        embody_agents::{AgentRecord, StaticAgentDirectory, ingestion::INGEST_PATH, spec::Method},
    };

    fn resolver(debug_session: bool) -> AgentContextResolver {
        let mut dir = StaticAgentDirectory::default();
        dir.insert(AgentRecord {
            id: "A".into(),
            name: "Agent A".into(),
            description: None,
            team_id: "T".into(),
            domains: vec!["a.example.com".into(), "a.agent.embody.dev".into()],
            custom_auth: false,
            debug_session,
            spec: Arc::default(),
        });
        AgentContextResolver::new(Arc::new(dir), "agent.embody.dev")
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, v.parse().unwrap());
        }
        map
    }

    fn parts<'a>(headers: &'a HeaderMap, path: &'a str) -> RequestParts<'a> {
        RequestParts {
            headers,
            path,
            model: None,
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn header_identity_on_production_host_is_latest() {
        let h = headers(&[("x-agent-id", "A"), ("host", "api.example.com")]);
        let ctx = resolver(false).resolve(&parts(&h, "/chat/stream")).await.unwrap();
        assert_eq!(ctx.agent_id(), "A");
        assert_eq!(ctx.version.as_deref(), Some(LATEST_VERSION));
        assert!(!ctx.is_test_channel);
    }

    #[tokio::test]
    async fn localhost_is_test_channel_and_draft() {
        let h = headers(&[("x-agent-id", "A"), ("host", "localhost:5173")]);
        let ctx = resolver(false).resolve(&parts(&h, "/chat/stream")).await.unwrap();
        assert!(ctx.is_test_channel);
        assert_eq!(ctx.version, None);
        assert_eq!(ctx.domain, "localhost");
    }

    #[tokio::test]
    async fn hostname_lookup() {
        let h = headers(&[("host", "A.Example.com")]);
        let ctx = resolver(false).resolve(&parts(&h, "/tools/stream")).await.unwrap();
        assert_eq!(ctx.agent_id(), "A");
        assert_eq!(ctx.version.as_deref(), Some(LATEST_VERSION));

        let h = headers(&[("host", "a.agent.embody.dev")]);
        let ctx = resolver(false).resolve(&parts(&h, "/tools/stream")).await.unwrap();
        assert!(ctx.is_test_channel);
        assert_eq!(ctx.version, None);
    }

    #[tokio::test]
    async fn model_token_carries_version() {
        let h = headers(&[("host", "api.example.com")]);
        let req = RequestParts {
            model: Some("A@1.4"),
            ..parts(&h, "/chat/stream")
        };
        let ctx = resolver(false).resolve(&req).await.unwrap();
        assert_eq!(ctx.version.as_deref(), Some("1.4"));
    }

    #[tokio::test]
    async fn path_version_beats_latest() {
        let h = headers(&[("x-agent-id", "A"), ("host", "api.example.com")]);
        let ctx = resolver(false).resolve(&parts(&h, "/v3/chat/stream")).await.unwrap();
        assert_eq!(ctx.version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn debug_header_needs_debug_session() {
        let h = headers(&[
            ("x-agent-id", "A"),
            ("host", "api.example.com"),
            ("x-debug", "1"),
        ]);
        assert!(!resolver(false).resolve(&parts(&h, "/")).await.unwrap().is_test_channel);
        assert!(resolver(true).resolve(&parts(&h, "/")).await.unwrap().is_test_channel);
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let h = headers(&[("host", "nobody.example.com")]);
        let err = resolver(false).resolve(&parts(&h, "/")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));

        let h = headers(&[("x-agent-id", "ghost"), ("host", "api.example.com")]);
        let err = resolver(false).resolve(&parts(&h, "/")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn attachments_inject_ingestion() {
        let h = headers(&[
            ("x-agent-id", "A"),
            ("host", "api.example.com"),
            ("x-conversation-id", "conv-9"),
            ("authorization", "Bearer user-token"),
        ]);
        let req = RequestParts {
            has_attachments: true,
            ..parts(&h, "/chat/stream")
        };
        let ctx = resolver(false).resolve(&req).await.unwrap();
        assert!(ctx.spec.operation(Method::Post, INGEST_PATH).is_some());
        assert!(ctx.agent.spec.operation(Method::Post, INGEST_PATH).is_none());
        assert_eq!(ctx.meta.conversation_id.as_deref(), Some("conv-9"));
        assert_eq!(ctx.meta.bearer_token.as_deref(), Some("user-token"));
    }

    #[test]
    fn helpers() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
        assert!(is_sandbox_host("agent.embody.dev", "agent.embody.dev"));
        assert!(is_sandbox_host("x.agent.embody.dev", "agent.embody.dev"));
        assert!(!is_sandbox_host("xagent.embody.dev", "agent.embody.dev"));
        assert_eq!(parse_model("A"), Some(("A".into(), None)));
        assert_eq!(parse_model("@1"), None);
        assert_eq!(version_from_path("/v1.2/tools/stream").as_deref(), Some("1.2"));
        assert_eq!(version_from_path("/voice/ephemeral-key"), None);
    }
}

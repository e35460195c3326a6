use axum::http::{HeaderMap, header::AUTHORIZATION};

use {crate::error::GatewayError, embody_agents::AgentContext};

pub fn is_loopback(ip: &str) -> bool {
    ip.starts_with("127.") || ip == "::1" || ip.starts_with("::ffff:127.")
}

/// Loopback hostnames, as seen in the `Host` header (port stripped).
pub fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || is_loopback(host.trim_matches(['[', ']']))
}

/// Bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Tool and voice embodiments require platform-managed auth.
pub fn ensure_platform_auth(ctx: &AgentContext) -> Result<(), GatewayError> {
    if ctx.agent.custom_auth {
        return Err(GatewayError::Unauthorized(format!(
            "agent {} uses custom authentication, which this embodiment does not support",
            ctx.agent_id()
        )));
    }
    Ok(())
}

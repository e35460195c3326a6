use {
    axum::{
        Json,
        http::{HeaderValue, StatusCode, header::RETRY_AFTER},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::error,
};

use {embody_agents::InvokeError, embody_vault::VaultError, embody_voice::VoiceError};

/// Body text of every 500 response.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests, retry in {retry_after} seconds")]
    RateLimited { retry_after: u64 },

    #[error("Too many concurrent requests, wait for one to finish")]
    ConcurrencyLimited,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } | Self::ConcurrencyLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind for response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::ConcurrencyLimited => "concurrency_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::Upstream(_) => "upstream_error",
            Self::Validation(_) => "validation_error",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::RateLimited { retry_after } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "retryAfter": retry_after,
            }),
            Self::Internal(detail) => {
                error!(%detail, "internal gateway error");
                json!({"error": self.kind(), "message": INTERNAL_ERROR_MESSAGE})
            },
            _ => json!({"error": self.kind(), "message": self.to_string()}),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { retry_after } = self
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}

impl From<InvokeError> for GatewayError {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::Cancelled => Self::Upstream("agent invocation cancelled".into()),
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<VaultError> for GatewayError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::UnknownCandidate(id) => Self::NotFound(format!("unknown agent: {id}")),
            VaultError::Forbidden(team) => {
                Self::Unauthorized(format!("no access to secrets of team {team}"))
            },
            other => Self::Upstream(other.to_string()),
        }
    }
}

impl From<VoiceError> for GatewayError {
    fn from(err: VoiceError) -> Self {
        Self::Upstream(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, axum::body::to_bytes};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited { retry_after: 60 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "60");
        let body = body_json(response).await;
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["error"], "rate_limited");
    }

    #[tokio::test]
    async fn internal_detail_is_hidden() {
        let response = GatewayError::Internal("db password wrong".into()).into_response();
        let body = body_json(response).await;
        assert_eq!(body["message"], INTERNAL_ERROR_MESSAGE);
    }

    #[test]
    fn statuses() {
        assert_eq!(
            GatewayError::ConcurrencyLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::from(VaultError::Unreachable("down".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}

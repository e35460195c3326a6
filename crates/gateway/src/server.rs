use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::State,
        middleware::from_fn_with_state,
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any as AnyOrigin, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{error, info},
};

use {
    embody_agents::{HttpAgentRuntime, StaticAgentDirectory},
    embody_config::EmbodyConfig,
    embody_vault::SecretBroker,
    embody_voice::OpenAiRealtime,
};

use crate::{
    chat::chat_stream_handler,
    error::GatewayError,
    rate_limit::admission_layer,
    state::GatewayState,
    tools::{tool_message_handler, tool_stream_handler},
    voice::{ephemeral_key_handler, relay_handler, ws_connect_handler},
};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
///
/// Embodiment routes are mounted at the root and again under `/{version}`;
/// both pass through admission. `/health` does not.
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let api = Router::new()
        .route("/chat/stream", post(chat_stream_handler))
        .route("/tools/stream", get(tool_stream_handler))
        .route("/tools/message", post(tool_message_handler))
        .route("/voice/ephemeral-key", post(ephemeral_key_handler))
        .route("/voice/ws-connect", post(ws_connect_handler))
        .route("/voice/relay", get(relay_handler))
        .route_layer(from_fn_with_state(Arc::clone(&state), admission_layer));

    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    Router::new()
        .route("/health", get(health_handler))
        .merge(api.clone())
        .nest("/{version}", api)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    GatewayError::Internal(format!("handler panicked: {detail}")).into_response()
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the gateway HTTP + WebSocket server and run until ctrl-c.
pub async fn start_gateway(config: EmbodyConfig) -> anyhow::Result<()> {
    let directory = Arc::new(
        StaticAgentDirectory::from_entries(&config.agents).context("failed to load agents")?,
    );
    let agent_count = directory.len();
    let runtime = Arc::new(HttpAgentRuntime::new(
        &config.runtime.url,
        Duration::from_secs(config.runtime.timeout_secs),
    )?);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.runtime.timeout_secs))
        .build()?;
    let vault = Arc::new(SecretBroker::from_config(
        client.clone(),
        &config.vault,
        directory.clone(),
    ));
    let realtime = Arc::new(OpenAiRealtime::new(client, config.voice.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;
    let state = GatewayState::new(
        config,
        directory,
        runtime,
        vault,
        realtime.clone(),
        realtime,
    );
    let app = build_gateway_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let limits = &state.config.rate_limit;
    let lines = [
        format!("embody gateway v{}", state.version),
        format!("listening on {addr}"),
        format!("{agent_count} agents, runtime {}", state.config.runtime.url),
        format!(
            "admission: {}/min, {} concurrent{}",
            limits.requests_per_minute,
            limits.max_concurrent_requests,
            if limits.fail_closed { ", fail-closed" } else { "" }
        ),
        format!(
            "voice: {} ({})",
            state.realtime.model(),
            state.realtime.voice()
        ),
    ];
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let shutdown = CancellationToken::new();
    Arc::clone(&state.admission).spawn_sweeper(shutdown.clone());

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let closed = state.voice.close_all();
    shutdown.cancel();
    info!(voice_calls = closed, "gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "toolSessions": state.tool_sessions.len(),
        "voiceCalls": state.voice.len(),
    }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::test_support::{FakeRuntime, MemoryStore, StallingRuntime, test_state},
        axum::{
            body::{Body, BodyDataStream, to_bytes},
            http::{Request, StatusCode},
        },
        embody_agents::AgentRuntime,
        embody_config::{RateLimitConfig, ServerConfig, VoiceConfig},
        futures::StreamExt,
        serde_json::Value,
        std::time::Duration,
        tower::ServiceExt,
    };

    fn config_with(limits: RateLimitConfig) -> EmbodyConfig {
        EmbodyConfig {
            rate_limit: limits,
            server: ServerConfig {
                trust_forwarded_for: true,
                ..ServerConfig::default()
            },
            ..EmbodyConfig::default()
        }
    }

    fn app_with(limits: RateLimitConfig, runtime: FakeRuntime) -> Router {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(runtime);
        build_gateway_app(test_state(config_with(limits), runtime, MemoryStore::default()))
    }

    fn app() -> Router {
        app_with(RateLimitConfig::default(), FakeRuntime {
            chunks: vec!["hel".into(), "lo".into()],
            fail_with: None,
        })
    }

    fn limits(rpm: u32, concurrent: u32) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: rpm,
            max_concurrent_requests: concurrent,
            ..RateLimitConfig::default()
        }
    }

    fn chat(path: &str, client: &str, agent: &str) -> Request<Body> {
        Request::post(path)
            .header("host", "localhost")
            .header("x-forwarded-for", client)
            .header("x-agent-id", agent)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"message":"hi"}"#))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Next server-sent event frame of a streaming body.
    async fn next_frame(body: &mut BodyDataStream) -> String {
        let bytes = tokio::time::timeout(Duration::from_secs(2), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn tool_message(url: &str, body: &'static str) -> Request<Body> {
        Request::post(url)
            .header("x-forwarded-for", "203.0.113.7")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn chat_streams_chunks_as_events() {
        let response = app()
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains(r#"data: {"content":"hel"}"#));
        assert!(text.contains(r#"data: {"content":"lo"}"#));
    }

    #[tokio::test]
    async fn versioned_prefix_serves_the_same_routes() {
        let response = app()
            .oneshot(chat("/v2/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_agent_is_404() {
        let response = app()
            .oneshot(chat("/chat/stream", "203.0.113.7", "nobody"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn failure_before_first_chunk_is_a_plain_error() {
        let app = app_with(RateLimitConfig::default(), FakeRuntime {
            chunks: vec![],
            fail_with: Some(500),
        });
        let response = app
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn failure_mid_stream_ends_with_an_error_chunk() {
        let app = app_with(RateLimitConfig::default(), FakeRuntime {
            chunks: vec!["partial".into()],
            fail_with: Some(500),
        });
        let response = app
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(text.contains(r#""content":"partial""#));
        assert!(text.contains(r#""isError":true"#));
        assert!(text.contains(r#""errorType":"agent_error""#));
    }

    #[tokio::test]
    async fn request_over_the_minute_budget_is_429() {
        let app = app_with(limits(2, 0), FakeRuntime::default());
        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["retryAfter"], 60);
        assert_eq!(body["error"], "rate_limited");
    }

    #[tokio::test]
    async fn exempt_clients_are_never_limited() {
        let app = app_with(limits(1, 1), FakeRuntime::default());
        let mut held = Vec::new();
        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(chat("/chat/stream", "10.1.2.3", "A"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            held.push(response);
        }
    }

    #[tokio::test]
    async fn in_flight_stream_holds_its_concurrency_slot() {
        let app = app_with(limits(0, 1), FakeRuntime {
            chunks: vec!["x".into()],
            fail_with: None,
        });
        let first = app
            .clone()
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .clone()
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_str(&body_text(second).await).unwrap();
        assert_eq!(body["error"], "concurrency_limited");

        body_text(first).await;
        let third = app
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(third.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn message_for_unknown_tool_session_is_404() {
        let request = Request::post("/tools/message?sessionId=missing")
            .header("x-forwarded-for", "203.0.113.7")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            ))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ephemeral_key_without_vault_key_is_401() {
        let request = Request::post("/voice/ephemeral-key")
            .header("host", "localhost")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-agent-id", "A")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(body["message"].as_str().unwrap().contains("openai"));
    }

    #[tokio::test]
    async fn ws_connect_requires_call_id() {
        let request = Request::post("/voice/ws-connect?ephemeralKey=ek")
            .header("host", "localhost")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-agent-id", "A")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tool_session_lives_as_long_as_its_stream() {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeRuntime::default());
        let state = test_state(
            config_with(RateLimitConfig::default()),
            runtime,
            MemoryStore::default(),
        );
        let app = build_gateway_app(Arc::clone(&state));
        let before = state.tool_sessions.len();

        let request = Request::get("/tools/stream")
            .header("host", "localhost")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-agent-id", "A")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut events = response.into_body().into_data_stream();

        let endpoint = next_frame(&mut events).await;
        assert!(endpoint.contains("event: endpoint"));
        let url = endpoint
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap()
            .to_string();
        assert!(url.starts_with("/tools/message?sessionId="));
        assert_eq!(state.tool_sessions.len(), before + 1);

        let list = r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#;
        let response = app.clone().oneshot(tool_message(&url, list)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let message = next_frame(&mut events).await;
        assert!(message.contains("event: message"));
        assert!(message.contains(r#""name":"search""#));

        drop(events);
        assert_eq!(state.tool_sessions.len(), before);
        let response = app.oneshot(tool_message(&url, list)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_tool_message_is_a_validation_error() {
        let response = app()
            .oneshot(tool_message("/tools/message?sessionId=any", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"], "validation_error");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_the_turn_and_frees_the_slot() {
        let runtime = Arc::new(StallingRuntime::default());
        let shared: Arc<dyn AgentRuntime> = runtime.clone();
        let state = test_state(config_with(limits(0, 1)), shared, MemoryStore::default());
        let app = build_gateway_app(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let mut events = response.into_body().into_data_stream();
        assert!(next_frame(&mut events).await.contains(r#""content":"first""#));

        let token = runtime.token().unwrap();
        assert!(!token.is_cancelled());
        assert_eq!(state.admission.in_flight("203.0.113.7"), 1);

        drop(events);
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert_eq!(state.admission.in_flight("203.0.113.7"), 0);

        let again = app
            .oneshot(chat("/chat/stream", "203.0.113.7", "A"))
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ephemeral_key_is_minted_with_the_team_key() {
        let mut server = mockito::Server::new_async().await;
        let mint = server
            .mock("POST", "/realtime/sessions")
            .match_header("authorization", "Bearer sk-team")
            .with_body(r#"{"model": "gpt-4o-realtime-preview", "client_secret": {"value": "ek_9", "expires_at": 1700000000}}"#)
            .create_async()
            .await;
        let config = EmbodyConfig {
            voice: VoiceConfig {
                api_base: server.url(),
                ..VoiceConfig::default()
            },
            ..config_with(RateLimitConfig::default())
        };
        let runtime: Arc<dyn AgentRuntime> = Arc::new(FakeRuntime::default());
        let store = MemoryStore::default().with("T", "openai", "sk-team");
        let app = build_gateway_app(test_state(config, runtime, store));

        let request = Request::post("/voice/ephemeral-key")
            .header("host", "localhost")
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-agent-id", "A")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["ephemeralKey"], "ek_9");
        assert_eq!(body["expiresAt"], 1_700_000_000);
        mint.assert_async().await;
    }
}

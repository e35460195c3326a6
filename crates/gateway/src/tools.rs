//! Tool-calling embodiment: JSON-RPC over an event stream (`GET
//! /tools/stream`) plus posted messages (`POST /tools/message`).
//!
//! Each stream gets a session id and a worker task that drains the
//! session's inbox one message at a time, so calls posted to one session are
//! handled in arrival order while sessions run independently.

use std::{convert::Infallible, sync::Arc};

use {
    axum::{
        Json,
        extract::{OriginalUri, Query, State, rejection::JsonRejection},
        http::{HeaderMap, StatusCode},
        response::{
            IntoResponse, Response,
            sse::{Event, KeepAlive, Sse},
        },
    },
    serde::Deserialize,
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tokio_util::sync::{CancellationToken, DropGuard},
    tracing::{debug, info, warn},
};

use {
    embody_agents::{AgentCall, AgentContext, AgentRuntime},
    embody_protocol::{
        JsonRpcRequest, JsonRpcResponse, TOOL_PROTOCOL_VERSION, ToolCallParams, ToolCallResult,
        error_codes,
    },
    embody_tools::{Protocol, find_operation, to_tool_descriptors},
};

use crate::{
    auth::ensure_platform_auth, context::RequestParts, error::GatewayError, state::GatewayState,
};

/// Registry transport for a tool session: the inbox its worker drains.
#[derive(Debug, Clone)]
pub struct ToolSessionHandle {
    inbox: mpsc::UnboundedSender<JsonRpcRequest>,
}

/// Deregisters the session and stops its worker when the stream is dropped.
struct SessionGuard {
    state: Arc<GatewayState>,
    session_id: String,
    _cancel: DropGuard,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.tool_sessions.deregister(&self.session_id);
        info!(session_id = %self.session_id, "tool session closed");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

pub async fn tool_stream_handler(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let ctx = state
        .resolver
        .resolve(&RequestParts {
            headers: &headers,
            path: uri.path(),
            model: None,
            has_attachments: false,
        })
        .await?;
    ensure_platform_auth(&ctx)?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();

    state
        .tool_sessions
        .register(&session_id, ToolSessionHandle { inbox: inbox_tx })
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(session_worker(
        Arc::clone(&state),
        ctx,
        session_id.clone(),
        inbox_rx,
        events_tx.clone(),
        cancel.clone(),
    ));

    let prefix = uri.path().trim_end_matches("/tools/stream");
    let endpoint = format!("{prefix}/tools/message?sessionId={session_id}");
    let _ = events_tx.send(Event::default().event("endpoint").data(endpoint));
    drop(events_tx);
    info!(%session_id, "tool session opened");

    let guard = SessionGuard {
        state: Arc::clone(&state),
        session_id,
        _cancel: cancel.drop_guard(),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = events_rx.recv().await {
            yield Ok::<_, Infallible>(event);
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMessageQuery {
    session_id: String,
}

pub async fn tool_message_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ToolMessageQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<StatusCode, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::Validation(e.body_text()))?;
    let request: JsonRpcRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid JSON-RPC message: {e}")))?;

    let handle = state
        .tool_sessions
        .get(&query.session_id)
        .ok_or_else(|| GatewayError::NotFound(format!("unknown session {}", query.session_id)))?;
    handle
        .inbox
        .send(request)
        .map_err(|_| GatewayError::NotFound(format!("session {} closed", query.session_id)))?;
    Ok(StatusCode::ACCEPTED)
}

// ── Session worker ───────────────────────────────────────────────────────────

async fn session_worker(
    state: Arc<GatewayState>,
    ctx: AgentContext,
    session_id: String,
    mut inbox: mpsc::UnboundedReceiver<JsonRpcRequest>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(r) => r,
                None => break,
            },
        };
        debug!(%session_id, method = %request.method, "tool message");

        let Some(response) = dispatch(state.runtime.as_ref(), &ctx, request, &cancel).await else {
            continue;
        };
        let data = serde_json::to_string(&response).unwrap_or_default();
        if events.send(Event::default().event("message").data(data)).is_err() {
            break;
        }
    }
    debug!(%session_id, "tool session worker stopped");
}

/// Handle one JSON-RPC message. Notifications produce no response.
pub async fn dispatch(
    runtime: &dyn AgentRuntime,
    ctx: &AgentContext,
    request: JsonRpcRequest,
    cancel: &CancellationToken,
) -> Option<JsonRpcResponse> {
    let id = request.id.clone();
    if request.jsonrpc != "2.0" {
        return (!request.is_notification()).then(|| {
            JsonRpcResponse::failure(
                id.unwrap_or_default(),
                error_codes::INVALID_REQUEST,
                format!("unsupported jsonrpc version {:?}", request.jsonrpc),
            )
        });
    }
    let notification = request.is_notification();
    let result = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": TOOL_PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": ctx.agent.name,
                "version": ctx.version.as_deref().unwrap_or("draft"),
            },
            "instructions": ctx.agent.display_description(),
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": to_tool_descriptors(&ctx.spec, Protocol::ToolCalling),
        })),
        "tools/call" => match request
            .params
            .map(serde_json::from_value::<ToolCallParams>)
        {
            Some(Ok(params)) => {
                let result =
                    match execute_tool(runtime, ctx, &params.name, params.arguments, cancel).await
                    {
                        Ok(output) => ToolCallResult::text(output),
                        Err(message) => {
                            warn!(agent_id = %ctx.agent_id(), tool = %params.name, error = %message, "tool call failed");
                            ToolCallResult::error(message)
                        },
                    };
                serde_json::to_value(result).map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
            },
            Some(Err(e)) => Err((error_codes::INVALID_PARAMS, e.to_string())),
            None => Err((error_codes::INVALID_PARAMS, "missing params".to_string())),
        },
        _ if notification => return None,
        other => Err((
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    };

    let id = id?;
    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err((code, message)) => JsonRpcResponse::failure(id, code, message),
    })
}

/// Run the operation behind `tool_name` and render its result as text.
pub async fn execute_tool(
    runtime: &dyn AgentRuntime,
    ctx: &AgentContext,
    tool_name: &str,
    arguments: Value,
    cancel: &CancellationToken,
) -> Result<String, String> {
    let op = find_operation(&ctx.spec, tool_name)
        .ok_or_else(|| format!("unknown tool: {tool_name}"))?;
    let call = AgentCall::from_arguments(&op, &arguments).map_err(|e| e.to_string())?;
    let value = runtime
        .invoke(ctx, call, cancel.child_token())
        .await
        .map_err(|e| e.to_string())?;
    Ok(match value {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

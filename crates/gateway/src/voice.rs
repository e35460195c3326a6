//! Voice embodiment: a realtime speech session relayed between clients and
//! the speech provider, with the agent's operations exposed as functions.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{
            OriginalUri, Query, State,
            ws::{Message, WebSocketUpgrade},
        },
        http::HeaderMap,
        response::{IntoResponse, Response},
    },
    futures::{Sink, SinkExt, Stream, StreamExt},
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::json,
    tokio::sync::{broadcast, mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    embody_agents::{AgentContext, AgentRuntime},
    embody_tools::{Protocol, to_tool_descriptors},
    embody_vault::{AccessCandidate, SecretScope},
    embody_voice::{
        FunctionCall, INTRODUCTION_PROMPT, RealtimeConnector, RealtimeSocket, ServerEvent,
        UpstreamEvent, realtime::events, voice_instructions,
    },
};

use crate::{
    auth::ensure_platform_auth,
    context::RequestParts,
    error::GatewayError,
    registry::ConnectionRegistry,
    state::GatewayState,
    tools::execute_tool,
};

/// Upstream frames buffered per relay client before it starts lagging.
const RELAY_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Connecting,
    Open,
    Closed,
}

/// Registry transport for one relayed call.
#[derive(Debug, Clone)]
pub struct CallHandle {
    /// Distinguishes this connection from later ones reusing the call id.
    conn_id: String,
    /// Agent the call was opened for; relay clients must resolve to it.
    agent_id: String,
    /// Text frames from relay clients, forwarded upstream in order.
    to_upstream: mpsc::UnboundedSender<String>,
    /// Upstream frames fanned out to relay clients.
    from_upstream: broadcast::Sender<String>,
    state: watch::Receiver<CallState>,
    cancel: CancellationToken,
}

impl CallHandle {
    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Created,
    /// A live connection already exists for the call; nothing was done.
    AlreadyExists,
}

pub struct VoiceRelay {
    calls: Arc<ConnectionRegistry<CallHandle>>,
    connector: Arc<dyn RealtimeConnector>,
    runtime: Arc<dyn AgentRuntime>,
    voice: String,
}

impl VoiceRelay {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        runtime: Arc<dyn AgentRuntime>,
        voice: &str,
    ) -> Self {
        Self {
            calls: Arc::new(ConnectionRegistry::new()),
            connector,
            runtime,
            voice: voice.to_string(),
        }
    }

    /// Open and register the upstream socket for `call_id`. Idempotent while
    /// a connection for the call is live.
    pub async fn create_connection(
        &self,
        ctx: AgentContext,
        call_id: &str,
        ephemeral_key: &Secret<String>,
    ) -> Result<ConnectOutcome, GatewayError> {
        let (to_upstream, client_frames) = mpsc::unbounded_channel();
        let (from_upstream, _) = broadcast::channel(RELAY_BUFFER);
        let (state_tx, state_rx) = watch::channel(CallState::Connecting);
        let cancel = CancellationToken::new();
        let conn_id = uuid::Uuid::new_v4().to_string();
        let handle = CallHandle {
            conn_id: conn_id.clone(),
            agent_id: ctx.agent_id().to_string(),
            to_upstream,
            from_upstream: from_upstream.clone(),
            state: state_rx,
            cancel: cancel.clone(),
        };

        // Reserve the id before connecting so concurrent creates cannot race.
        if self.calls.register(call_id, handle).is_err() {
            debug!(call_id, "voice connection already live");
            return Ok(ConnectOutcome::AlreadyExists);
        }

        let socket = match self.connector.connect(call_id, ephemeral_key).await {
            Ok(socket) => socket,
            Err(e) => {
                self.calls.deregister(call_id);
                warn!(call_id, error = %e, "realtime connect failed");
                return Err(e.into());
            },
        };

        let driver = CallDriver {
            call_id: call_id.to_string(),
            conn_id,
            ctx,
            calls: Arc::clone(&self.calls),
            runtime: Arc::clone(&self.runtime),
            voice: self.voice.clone(),
            state: state_tx,
            from_upstream,
            cancel,
        };
        tokio::spawn(driver.run(socket, client_frames));
        info!(call_id, "voice connection created");
        Ok(ConnectOutcome::Created)
    }

    pub fn get(&self, call_id: &str) -> Option<CallHandle> {
        self.calls.get(call_id)
    }

    /// The live call `call_id`, provided it belongs to the agent in `ctx`.
    /// Calls of other agents are reported as missing.
    pub fn attach(&self, call_id: &str, ctx: &AgentContext) -> Result<CallHandle, GatewayError> {
        self.get(call_id)
            .filter(|handle| handle.agent_id == ctx.agent_id())
            .ok_or_else(|| GatewayError::NotFound(format!("call {call_id} not found")))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Tear down every connection.
    pub fn close_all(&self) -> usize {
        let sessions = self.calls.drain();
        for session in &sessions {
            session.transport.cancel.cancel();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closed all voice connections");
        }
        sessions.len()
    }
}

// ── Per-call state machine ───────────────────────────────────────────────────

struct CallDriver {
    call_id: String,
    conn_id: String,
    ctx: AgentContext,
    calls: Arc<ConnectionRegistry<CallHandle>>,
    runtime: Arc<dyn AgentRuntime>,
    voice: String,
    state: watch::Sender<CallState>,
    from_upstream: broadcast::Sender<String>,
    cancel: CancellationToken,
}

impl CallDriver {
    async fn run(
        self,
        mut socket: RealtimeSocket,
        mut client_frames: mpsc::UnboundedReceiver<String>,
    ) {
        self.on_open(&socket);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(frame) = client_frames.recv() => {
                    if socket.outbound.send(frame).is_err() {
                        break;
                    }
                },
                event = socket.inbound.recv() => match event {
                    Some(UpstreamEvent::Message(text)) => self.on_message(&socket, text),
                    Some(UpstreamEvent::Error(e)) => {
                        warn!(call_id = %self.call_id, error = %e, "realtime upstream error");
                        break;
                    },
                    Some(UpstreamEvent::Closed) | None => break,
                },
            }
        }

        self.on_close();
    }

    /// Connecting → Open: configure the session, then ask for a greeting.
    fn on_open(&self, socket: &RealtimeSocket) {
        let _ = self.state.send(CallState::Open);

        let tools = to_tool_descriptors(&self.ctx.spec, Protocol::Realtime)
            .iter()
            .map(|t| t.to_realtime_function())
            .collect::<Vec<_>>();
        let instructions =
            voice_instructions(&self.ctx.agent.name, self.ctx.agent.display_description());
        debug!(call_id = %self.call_id, tools = tools.len(), "configuring realtime session");

        send(socket, &events::session_update(&instructions, tools, &self.voice));
        send(socket, &events::response_create(Some(INTRODUCTION_PROMPT)));
    }

    fn on_message(&self, socket: &RealtimeSocket, text: String) {
        let calls = ServerEvent::parse(&text)
            .map(|event| event.function_calls())
            .unwrap_or_default();
        // No receivers is fine.
        let _ = self.from_upstream.send(text);

        if !calls.is_empty() {
            tokio::spawn(run_function_calls(
                Arc::clone(&self.runtime),
                self.ctx.clone(),
                calls,
                socket.outbound.clone(),
                self.cancel.child_token(),
                self.call_id.clone(),
            ));
        }
    }

    /// Open → Closed. Cancelling detaches relay clients and stops pending
    /// function calls.
    fn on_close(&self) {
        let _ = self.state.send(CallState::Closed);
        self.cancel.cancel();
        let ours = |h: &CallHandle| h.conn_id == self.conn_id;
        if self.calls.peek(&self.call_id, ours) {
            self.calls.mark_disconnected(&self.call_id);
        }
        self.calls.deregister_if(&self.call_id, ours);
        info!(call_id = %self.call_id, "voice connection closed");
    }
}

fn send(socket: &RealtimeSocket, message: &serde_json::Value) {
    let _ = socket.outbound.send(message.to_string());
}

/// Execute the calls in order, return each output, then ask the model to
/// continue once all outputs are in.
async fn run_function_calls(
    runtime: Arc<dyn AgentRuntime>,
    ctx: AgentContext,
    calls: Vec<FunctionCall>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    call_id: String,
) {
    for call in calls {
        let output = match execute_tool(runtime.as_ref(), &ctx, &call.name, call.arguments, &cancel)
            .await
        {
            Ok(output) => output,
            Err(message) => {
                warn!(%call_id, function = %call.name, error = %message, "voice function call failed");
                json!({"error": message}).to_string()
            },
        };
        if cancel.is_cancelled() {
            return;
        }
        let item = events::function_call_output(&call.call_id, &output);
        if outbound.send(item.to_string()).is_err() {
            return;
        }
    }
    let _ = outbound.send(events::response_create(None).to_string());
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn resolve(
    state: &GatewayState,
    headers: &HeaderMap,
    path: &str,
) -> Result<AgentContext, GatewayError> {
    let ctx = state
        .resolver
        .resolve(&RequestParts {
            headers,
            path,
            model: None,
            has_attachments: false,
        })
        .await?;
    ensure_platform_auth(&ctx)?;
    Ok(ctx)
}

pub async fn ephemeral_key_handler(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let ctx = resolve(&state, &headers, uri.path()).await?;
    let key_name = &state.config.voice.provider_key;

    let api_key = state
        .vault
        .get_in(
            &SecretScope::new(ctx.agent.team_id.clone()),
            key_name,
            &AccessCandidate::Agent(ctx.agent_id().to_string()),
        )
        .await?
        .ok_or_else(|| {
            GatewayError::Unauthorized(format!(
                "No '{key_name}' API key is stored for this agent's team. Add it to the team vault to enable voice."
            ))
        })?;

    let key = state.realtime.mint_ephemeral_key(&api_key).await?;
    info!(agent_id = %ctx.agent_id(), expires_at = key.expires_at, "issued ephemeral voice key");

    Ok(Json(json!({
        "ephemeralKey": key.value.expose_secret(),
        "expiresAt": key.expires_at,
        "model": key.model,
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConnectQuery {
    #[serde(default)]
    call_id: String,
    #[serde(default)]
    ephemeral_key: String,
}

pub async fn ws_connect_handler(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<WsConnectQuery>,
) -> Result<Response, GatewayError> {
    if query.call_id.trim().is_empty() {
        return Err(GatewayError::Validation("callId is required".into()));
    }
    if query.ephemeral_key.trim().is_empty() {
        return Err(GatewayError::Validation("ephemeralKey is required".into()));
    }
    let ctx = resolve(&state, &headers, uri.path()).await?;

    let key = Secret::new(query.ephemeral_key);
    match state.voice.create_connection(ctx, &query.call_id, &key).await? {
        ConnectOutcome::Created => Ok(Json(json!({
            "success": true,
            "callId": query.call_id,
        }))
        .into_response()),
        ConnectOutcome::AlreadyExists => Err(GatewayError::Conflict(format!(
            "call {} is already connected",
            query.call_id
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayQuery {
    call_id: String,
}

pub async fn relay_handler(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<RelayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let ctx = resolve(&state, &headers, uri.path()).await?;
    let handle = state.voice.attach(&query.call_id, &ctx)?;
    let call_id = query.call_id;
    Ok(ws
        .on_upgrade(move |socket| {
            let (sink, stream) = socket.split();
            relay_frames(sink, stream, handle, call_id)
        })
        .into_response())
}

/// Pump frames between one relay client and the call until either side
/// closes or the call ends.
async fn relay_frames<Tx, Rx>(mut sink: Tx, mut stream: Rx, handle: CallHandle, call_id: String)
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut upstream = handle.from_upstream.subscribe();
    debug!(%call_id, "relay client attached");

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            frame = upstream.recv() => match frame {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%call_id, skipped, "relay client lagging");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if handle.to_upstream.send(text.to_string()).is_err() {
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {},
            },
        }
    }

    let _ = sink.close().await;
    debug!(%call_id, "relay client detached");
}

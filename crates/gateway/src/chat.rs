//! `POST /chat/stream`: one chat turn relayed as server-sent events.

use std::{convert::Infallible, sync::Arc};

use {
    axum::{
        Json,
        extract::{OriginalUri, State, rejection::JsonRejection},
        http::HeaderMap,
        response::{
            IntoResponse, Response,
            sse::{Event, KeepAlive, Sse},
        },
    },
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use embody_protocol::{Attachment, ChatChunk, ChatRequest};

use crate::{context::RequestParts, error::GatewayError, state::GatewayState};

pub async fn chat_stream_handler(
    State(state): State<Arc<GatewayState>>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(req) = body.map_err(|e| GatewayError::Validation(e.body_text()))?;
    if req.message.trim().is_empty() && req.attachments.is_empty() {
        return Err(GatewayError::Validation("message must not be empty".into()));
    }

    let ctx = state
        .resolver
        .resolve(&RequestParts {
            headers: &headers,
            path: uri.path(),
            model: req.model.as_deref(),
            has_attachments: !req.attachments.is_empty(),
        })
        .await?;

    let message = compose_message(&req.message, &req.attachments);
    let cancel = CancellationToken::new();
    // Dropped with the response stream, which cancels the upstream turn.
    let guard = cancel.clone().drop_guard();
    let mut upstream = state.runtime.chat_stream(&ctx, message, cancel);

    // Nothing has been sent yet, so a failure here is still a plain error.
    let first = match upstream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => {
            warn!(agent_id = %ctx.agent_id(), error = %e, "chat turn failed before first chunk");
            return Err(e.into());
        },
        None => None,
    };
    info!(agent_id = %ctx.agent_id(), version = ?ctx.version, "chat stream started");

    let agent_id = ctx.agent_id().to_string();
    let stream = async_stream::stream! {
        let _guard = guard;
        if let Some(chunk) = first {
            yield Ok::<_, Infallible>(chunk_event(&chunk));
        }
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => yield Ok(chunk_event(&chunk)),
                Err(e) => {
                    warn!(%agent_id, error = %e, "chat turn failed mid-stream");
                    yield Ok(chunk_event(&ChatChunk::error(e.kind(), e.to_string())));
                    break;
                },
            }
        }
        debug!(%agent_id, "chat stream finished");
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

fn chunk_event(chunk: &ChatChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
}

/// The user message with attachments appended as trailing JSON references.
pub fn compose_message(message: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return message.to_string();
    }
    let refs = serde_json::to_string(attachments).unwrap_or_default();
    format!("{message}\n\n[attachments]\n{refs}")
}

//! Axum handlers for the chat API.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Multipart, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::{StreamExt, stream};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::HttpState;
use super::form::parse_chat_form;
use crate::chat::ChatStream;

/// Terminal event of every stream.
const DONE: &str = "[DONE]";

// ── Helpers ───────────────────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": msg.to_string() }))).into_response()
}

/// SSE payloads may not carry carriage returns; newlines become extra `data:` lines.
fn sse_text(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /health
pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// POST /api/v1/chat
pub(super) async fn chat(State(state): State<HttpState>, multipart: Multipart) -> Response {
    let request_id = Uuid::new_v4();
    let request = match parse_chat_form(multipart, &state.defaults).await {
        Ok(r) => r,
        Err(e) => {
            warn!(%request_id, "rejected chat form: {e}");
            return json_error(e.status(), e);
        }
    };
    info!(%request_id, model_id = %request.variant.model_id, files = request.uploads.len(), "chat request");

    match state.chat.run_chat(request).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            warn!(%request_id, "chat failed: {e}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

/// POST /api/v1/chat/stream
///
/// `data: <chunk>` per cleaned chunk, then `data: [DONE]`. A generation error
/// after the stream has started is reported as an `error` event before `[DONE]`.
pub(super) async fn chat_stream(State(state): State<HttpState>, multipart: Multipart) -> Response {
    let request_id = Uuid::new_v4();
    let request = match parse_chat_form(multipart, &state.defaults).await {
        Ok(r) => r,
        Err(e) => {
            warn!(%request_id, "rejected chat form: {e}");
            return json_error(e.status(), e);
        }
    };
    info!(%request_id, model_id = %request.variant.model_id, files = request.uploads.len(), "chat stream request");

    let chat_stream = match state.chat.stream_chat(request).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%request_id, "chat stream failed to start: {e}");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    let events = stream::unfold(Phase::Streaming(chat_stream), move |phase| async move {
        match phase {
            Phase::Streaming(mut s) => match s.next_chunk().await {
                Some(Ok(chunk)) => Some((Event::default().data(sse_text(&chunk)), Phase::Streaming(s))),
                Some(Err(e)) => {
                    warn!(%request_id, "chat stream aborted: {e}");
                    Some((Event::default().event("error").data(sse_text(&e.to_string())), Phase::Closing))
                }
                None => {
                    info!(%request_id, "chat stream complete");
                    Some((Event::default().data(DONE), Phase::Closed))
                }
            },
            Phase::Closing => Some((Event::default().data(DONE), Phase::Closed)),
            Phase::Closed => None,
        }
    });

    Sse::new(events.map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::default())
        .into_response()
}

enum Phase {
    Streaming(ChatStream),
    Closing,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carriage_returns_normalised() {
        assert_eq!(sse_text("a\r\nb\rc\n"), "a\nb\nc\n");
    }
}

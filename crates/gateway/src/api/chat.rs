//! HTTP+SSE chat surface — the public entry point most callers use:
//!
//! - `POST /api/chat`               — accept a message, mint a stream id, run
//!   the turn in the background, return `202 { ok, streamId }` immediately.
//! - `GET /api/stream/:streamId`    — SSE: replay buffered events then follow
//!   the live ones, closing after `done`/`error`.
//! - `POST /api/clarify/:streamId`  — deliver an answer to the one mid-run
//!   clarification a stream can have outstanding.

use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::platform::http::{deliver_clarification_answer, SseEvent};
use crate::runtime::dispatch::dispatch;

use super::ApiState;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub message: String,
    #[serde(default, rename = "forceNew")]
    pub force_new: bool,
}

/// `POST /api/chat` — per spec §6.2, body `{ userId, message, forceNew? }`.
/// The turn runs to completion in a spawned task; the caller is expected to
/// connect `GET /api/stream/{streamId}` to watch it.
pub async fn post_chat(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !state.adapter.check_bearer(authorization.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"ok": false, "error": "unauthorized"})),
        )
            .into_response();
    }

    let stream_id = uuid::Uuid::new_v4().to_string();
    let raw = serde_json::json!({
        "_authorization": authorization,
        "platformKey": body.user_id,
        "text": body.message,
        "newSession": body.force_new,
        "streamId": stream_id,
    });

    let adapter = state.adapter.clone();
    let deps = state.deps.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatch(adapter.as_ref(), &raw, &deps).await {
            tracing::error!(error = %e, "chat turn failed");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"ok": true, "streamId": stream_id})),
    )
        .into_response()
}

/// `GET /api/stream/{streamId}` — replays whatever `StreamRegistry` already
/// buffered, then follows live events until `done`/`error`.
pub async fn get_stream(State(state): State<ApiState>, Path(stream_id): Path<String>) -> impl IntoResponse {
    let (buffered, mut rx) = state.app.stream_registry.subscribe(&stream_id);

    let stream = async_stream::stream! {
        let mut closed = false;
        for event in buffered {
            closed = is_terminal(&event);
            yield Ok::<_, std::convert::Infallible>(to_sse(&event));
        }
        if !closed {
            while let Some(event) = rx.recv().await {
                let terminal = is_terminal(&event);
                yield Ok(to_sse(&event));
                if terminal {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn is_terminal(event: &SseEvent) -> bool {
    matches!(event, SseEvent::Done { .. } | SseEvent::Error { .. })
}

fn to_sse(event: &SseEvent) -> Event {
    match event {
        SseEvent::Text { delta } => Event::default().event("text").data(delta.clone()),
        SseEvent::ToolCall { name, input } => Event::default()
            .event("tool_call")
            .data(serde_json::json!({"name": name, "input": input}).to_string()),
        SseEvent::Clarification { id, prompt } => Event::default()
            .event("clarification")
            .data(serde_json::json!({"id": id, "prompt": prompt}).to_string()),
        SseEvent::Done { result } => Event::default()
            .event("done")
            .data(serde_json::json!({"result": result}).to_string()),
        SseEvent::Error { message } => Event::default()
            .event("error")
            .data(serde_json::json!({"message": message}).to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ClarifyBody {
    #[serde(rename = "clarificationId")]
    #[allow(dead_code)]
    pub clarification_id: String,
    pub answer: String,
}

/// `POST /api/clarify/{streamId}` — there's at most one clarification
/// outstanding per stream (see `runtime::clarify`'s module doc), so
/// `clarificationId` is accepted for API-shape fidelity but not matched
/// against anything.
pub async fn post_clarify(
    State(state): State<ApiState>,
    Path(stream_id): Path<String>,
    Json(body): Json<ClarifyBody>,
) -> impl IntoResponse {
    let ok = deliver_clarification_answer(&state.app.clarifications, &stream_id, body.answer);
    Json(serde_json::json!({"ok": ok}))
}

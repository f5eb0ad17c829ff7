//! `POST /agent/run` — the internal, loopback-only, bearer-authenticated
//! route (per spec §6.2) that executes a single run synchronously and hands
//! back everything it produced instead of streaming it.

use std::sync::Arc;

use agentrt_domain::error::Result;
use agentrt_domain::session::CompactionEvent;
use agentrt_domain::tool::ClarificationRequest;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use parking_lot::Mutex;

use crate::platform::{AckResponse, IncomingMessage, PlatformAdapter, StreamHandle};
use crate::runtime::clarify::ClarificationHub;
use crate::runtime::dispatch::dispatch;

use super::{bearer_matches, ApiState};

/// How a run answers clarifications it can't forward to an interactive
/// caller. Per spec §6.2: `never` always answers (with the request's
/// default, or empty), `default` answers with the request's default and
/// otherwise lets the run fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AskPolicy {
    Never,
    Default,
}

impl AskPolicy {
    fn from_body(value: &serde_json::Value) -> Self {
        match value["askPolicy"].as_str() {
            Some("never") => AskPolicy::Never,
            _ => AskPolicy::Default,
        }
    }
}

struct AgentRunHandle {
    ask_policy: AskPolicy,
    clarifications: Arc<ClarificationHub>,
    stream_id: String,
    tool_calls: Mutex<Vec<(String, serde_json::Value)>>,
    compactions: Mutex<Vec<CompactionEvent>>,
    clarification_count: Mutex<u32>,
    result: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
}

#[async_trait]
impl StreamHandle for AgentRunHandle {
    async fn on_text(&self, _delta: &str) {}

    async fn on_tool_call(&self, name: &str, input: &serde_json::Value) {
        self.tool_calls.lock().push((name.to_string(), input.clone()));
    }

    async fn on_compaction(&self, event: &CompactionEvent) {
        self.compactions.lock().push(event.clone());
    }

    /// No interactive caller exists for this route, so the answer has to
    /// come from the request itself: `never` always unblocks the run, while
    /// `default` only unblocks when a default is present and otherwise
    /// drops the pending slot, which turns the loop's wait into an error.
    async fn on_clarification(&self, request: &ClarificationRequest) {
        *self.clarification_count.lock() += 1;
        match self.ask_policy {
            AskPolicy::Never => {
                let answer = request.default_answer.clone().unwrap_or_default();
                self.clarifications.answer(&self.stream_id, answer);
            }
            AskPolicy::Default => match &request.default_answer {
                Some(answer) => {
                    self.clarifications.answer(&self.stream_id, answer.clone());
                }
                None => self.clarifications.cancel(&self.stream_id),
            },
        }
    }

    async fn on_done(&self, result: &str) {
        *self.result.lock() = Some(result.to_string());
    }

    async fn on_error(&self, message: &str) {
        *self.error.lock() = Some(message.to_string());
    }
}

struct AgentRunAdapter {
    clarifications: Arc<ClarificationHub>,
    ask_policy: AskPolicy,
    handle: Mutex<Option<Arc<AgentRunHandle>>>,
}

#[async_trait]
impl PlatformAdapter for AgentRunAdapter {
    async fn verify_request(&self, _raw: &serde_json::Value) -> bool {
        // Bearer auth already happened in the handler before this adapter
        // was ever constructed.
        true
    }

    async fn parse_incoming(&self, raw: &serde_json::Value) -> Result<Option<IncomingMessage>> {
        Ok(Some(IncomingMessage {
            platform_key: raw["platformKey"].as_str().unwrap_or_default().to_string(),
            memory_key: None,
            text: raw["text"].as_str().unwrap_or_default().to_string(),
            force_new_session: raw["newSession"].as_bool().unwrap_or(false),
            stream_id: None,
        }))
    }

    async fn ack_request(&self, incoming: &IncomingMessage) -> AckResponse {
        AckResponse {
            stream_id: incoming.stream_id.clone().unwrap_or_default(),
        }
    }

    async fn create_stream_handle(
        &self,
        _incoming: &IncomingMessage,
        stream_id: &str,
    ) -> Arc<dyn StreamHandle> {
        let handle = Arc::new(AgentRunHandle {
            ask_policy: self.ask_policy,
            clarifications: self.clarifications.clone(),
            stream_id: stream_id.to_string(),
            tool_calls: Mutex::new(Vec::new()),
            compactions: Mutex::new(Vec::new()),
            clarification_count: Mutex::new(0),
            result: Mutex::new(None),
            error: Mutex::new(None),
        });
        *self.handle.lock() = Some(handle.clone());
        handle
    }
}

pub async fn run(State(state): State<ApiState>, headers: HeaderMap, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !bearer_matches(&state.app.internal_secret, authorization) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"ok": false, "error": "unauthorized"})),
        )
            .into_response();
    }

    let request_text = body["text"]
        .as_str()
        .or_else(|| body["message"].as_str())
        .or_else(|| body["prompt"].as_str())
        .unwrap_or_default()
        .to_string();
    let platform_key = body["platformKey"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("agent:run:{}", uuid::Uuid::new_v4()));
    let text = match body["skill"].as_str() {
        Some(skill) => format!("/skills {skill} {request_text}"),
        None => request_text.clone(),
    };
    let ask_policy = AskPolicy::from_body(&body);

    let adapter = Arc::new(AgentRunAdapter {
        clarifications: state.app.clarifications.clone(),
        ask_policy,
        handle: Mutex::new(None),
    });

    let raw = serde_json::json!({
        "platformKey": platform_key,
        "text": text,
        "newSession": body["forceNewSession"].as_bool().unwrap_or(false),
    });
    let run_id = uuid::Uuid::new_v4().to_string();

    if let Err(e) = dispatch(adapter.as_ref(), &raw, &state.deps).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": false, "error": e.to_string()})),
        )
            .into_response();
    }

    let handle = adapter
        .handle
        .lock()
        .clone()
        .expect("dispatch always creates a stream handle");
    let session_id = state
        .app
        .sessions
        .get_current_session_id(&platform_key)
        .unwrap_or_default();
    let compactions = handle.compactions.lock().clone();
    let tool_calls: Vec<_> = handle
        .tool_calls
        .lock()
        .iter()
        .map(|(name, input)| serde_json::json!({"name": name, "input": input}))
        .collect();

    Json(serde_json::json!({
        "ok": handle.error.lock().is_none(),
        "runId": run_id,
        "platformKey": platform_key,
        "sessionId": session_id,
        "requestText": request_text,
        "result": handle.result.lock().clone().unwrap_or_default(),
        "toolCalls": tool_calls,
        "compactionCount": compactions.len(),
        "compactions": compactions,
        "clarificationCount": *handle.clarification_count.lock(),
    }))
    .into_response()
}

//! `GET /api/sessions` — list a platform key's sessions, newest first.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use super::ApiState;

const MAX_SESSIONS: usize = 50;

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(rename = "platformKey")]
    pub platform_key: String,
}

pub async fn list_sessions(State(state): State<ApiState>, Query(params): Query<ListSessionsQuery>) -> impl IntoResponse {
    let sessions = state.app.sessions.list_sessions(&params.platform_key, MAX_SESSIONS);
    let current_session_id = state.app.sessions.get_current_session_id(&params.platform_key);

    Json(serde_json::json!({
        "sessions": sessions,
        "currentSessionId": current_session_id,
    }))
}

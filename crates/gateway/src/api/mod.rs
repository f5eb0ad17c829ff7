//! HTTP transport (C12) — the trimmed route table from spec §6.2: the
//! chat/stream/clarify/sessions surface the CLI's web equivalent uses, plus
//! the internal `/agent/run` route and a liveness probe.

pub mod agent_run;
pub mod chat;
pub mod sessions;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::platform::http::HttpAdapter;
use crate::runtime::dispatch::DispatcherDeps;
use crate::state::AppState;

/// What the API router closes over, beyond `AppState` itself: the HTTP
/// adapter (for the bearer check and stream bookkeeping `api::chat` needs)
/// and the `DispatcherDeps` every route hands to `dispatch`.
#[derive(Clone)]
pub struct ApiState {
    pub app: AppState,
    pub adapter: Arc<HttpAdapter>,
    pub deps: Arc<DispatcherDeps>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::post_chat))
        .route("/api/stream/:streamId", get(chat::get_stream))
        .route("/api/clarify/:streamId", post(chat::post_clarify))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/agent/run", post(agent_run::run))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ok"}))
}

/// Constant-time bearer check against an arbitrary configured secret (used
/// by `/agent/run`'s `internal_secret`, distinct from `HttpAdapter`'s own
/// `api_secret`-keyed check).
pub(crate) fn bearer_matches(secret: &Option<String>, header: Option<&str>) -> bool {
    use sha2::{Digest, Sha256};
    use subtle::ConstantTimeEq;

    let Some(secret) = secret else { return true };
    let expected = Sha256::digest(secret.as_bytes());
    let provided = header.and_then(|h| h.strip_prefix("Bearer ")).unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(&expected))
}

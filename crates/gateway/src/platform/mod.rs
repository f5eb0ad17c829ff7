//! Platform adapter boundary (C12) — the seam between a concrete transport
//! (CLI, HTTP+SSE) and the dispatcher. An adapter never sees the agent
//! loop directly; it only verifies, parses, acks, and streams.

pub mod cli;
pub mod http;

use agentrt_domain::error::Result;
use agentrt_domain::session::CompactionEvent;
use agentrt_domain::tool::ClarificationRequest;
use async_trait::async_trait;

/// One inbound message, normalized from whatever the transport received.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Stable per-user/channel routing key (the `platformKey`).
    pub platform_key: String,
    /// Optional identity-linking key (see `domain::config::sessions::IdentityLink`).
    pub memory_key: Option<String>,
    pub text: String,
    pub force_new_session: bool,
    /// Caller-supplied stream id, when the transport already allocated one
    /// (e.g. the HTTP adapter mints it before acking).
    pub stream_id: Option<String>,
}

/// What the dispatcher hands back to the transport immediately after ack.
#[derive(Debug, Clone)]
pub struct AckResponse {
    pub stream_id: String,
}

/// Sink the dispatcher pushes run progress into; implemented once per
/// transport (stdout for the CLI, an SSE buffer for HTTP).
#[async_trait]
pub trait StreamHandle: Send + Sync {
    async fn on_text(&self, delta: &str);
    async fn on_tool_call(&self, name: &str, input: &serde_json::Value);
    async fn on_tool_result(&self, _name: &str, _output: &serde_json::Value) {}
    /// Mid-run compaction, reported for transports that surface it (the
    /// internal `/agent/run` route's `compactions[]`); every other adapter
    /// keeps the default no-op.
    async fn on_compaction(&self, _event: &CompactionEvent) {}
    async fn on_clarification(&self, request: &ClarificationRequest);
    async fn on_done(&self, result: &str);
    async fn on_error(&self, message: &str);
}

/// A transport's half of the C12 boundary. `verify`/`parse`/`ack` run
/// synchronously relative to the inbound request; `create_stream_handle`
/// hands back the sink the dispatcher drains the run into.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    async fn verify_request(&self, raw: &serde_json::Value) -> bool;

    /// `None` means the request was fully handled here (heartbeat, dedup,
    /// clarification answer) and the dispatcher should do nothing further.
    async fn parse_incoming(&self, raw: &serde_json::Value) -> Result<Option<IncomingMessage>>;

    async fn ack_request(&self, incoming: &IncomingMessage) -> AckResponse;

    async fn create_stream_handle(
        &self,
        incoming: &IncomingMessage,
        stream_id: &str,
    ) -> std::sync::Arc<dyn StreamHandle>;
}

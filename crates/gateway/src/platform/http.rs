//! HTTP+SSE platform adapter — `POST /api/chat` allocates a stream, the
//! caller then connects `GET /api/stream/{streamId}` for events. Events are
//! buffered from the moment `create_stream_handle` runs, so a client that
//! connects after the loop has already produced a few deltas still gets the
//! full transcript (the buffer is replayed before live events continue).

use std::collections::HashMap;
use std::sync::Arc;

use agentrt_domain::config::{DmScope, InboundMetadata, SendPolicyMode, SessionsConfig};
use agentrt_domain::error::Result;
use agentrt_domain::tool::ClarificationRequest;
use agentrt_sessions::{compute_session_key, IdentityResolver, LifecycleManager, SessionStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::runtime::clarify::ClarificationHub;

use super::{AckResponse, IncomingMessage, PlatformAdapter, StreamHandle};

/// One SSE-serializable event. `event` names match spec §6.2's `text`,
/// `tool_call`, `clarification`, `done`, `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SseEvent {
    #[serde(rename = "text")]
    Text { delta: String },
    #[serde(rename = "tool_call")]
    ToolCall {
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "clarification")]
    Clarification {
        id: String,
        prompt: String,
    },
    #[serde(rename = "done")]
    Done { result: String },
    #[serde(rename = "error")]
    Error { message: String },
}

struct StreamState {
    buffer: Vec<SseEvent>,
    subscriber: Option<mpsc::UnboundedSender<SseEvent>>,
}

/// Per-process table of in-flight/just-finished streams, keyed by
/// `streamId`. Entries are dropped once a late subscriber has had a chance
/// to read the final `done`/`error` event (the dispatcher doesn't clean
/// this up itself — see [`StreamRegistry::sweep`]).
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, StreamState>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, stream_id: &str, event: SseEvent) {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream_id.to_string()).or_insert_with(|| StreamState {
            buffer: Vec::new(),
            subscriber: None,
        });
        if let Some(tx) = &state.subscriber {
            let _ = tx.send(event.clone());
        }
        state.buffer.push(event);
    }

    /// Replay the buffer so far, then register `tx` for subsequent events.
    /// Only one live subscriber per stream is supported; a second caller
    /// simply gets the buffer replayed with no further live events.
    pub fn subscribe(&self, stream_id: &str) -> (Vec<SseEvent>, mpsc::UnboundedReceiver<SseEvent>) {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream_id.to_string()).or_insert_with(|| StreamState {
            buffer: Vec::new(),
            subscriber: None,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = state.buffer.clone();
        state.subscriber = Some(tx);
        (buffered, rx)
    }

    /// Drop streams whose terminal event was pushed a while ago. Called
    /// from the background sweep alongside the session-store flush.
    pub fn sweep_done(&self) {
        self.streams.lock().retain(|_, state| {
            !matches!(
                state.buffer.last(),
                Some(SseEvent::Done { .. }) | Some(SseEvent::Error { .. })
            )
        });
    }
}

/// Shared state the axum handlers close over.
pub struct HttpAdapter {
    registry: Arc<StreamRegistry>,
    clarifications: Arc<ClarificationHub>,
    /// SHA-256 digest of the configured bearer token, computed once at
    /// startup. `None` means dev mode (no auth enforced).
    api_secret_hash: Option<[u8; 32]>,
    sessions: Arc<SessionStore>,
    identity: Arc<IdentityResolver>,
    lifecycle: Arc<LifecycleManager>,
    config: SessionsConfig,
}

impl HttpAdapter {
    pub fn new(
        registry: Arc<StreamRegistry>,
        clarifications: Arc<ClarificationHub>,
        api_secret: Option<String>,
        sessions: Arc<SessionStore>,
        identity: Arc<IdentityResolver>,
        lifecycle: Arc<LifecycleManager>,
        config: SessionsConfig,
    ) -> Self {
        use sha2::{Digest, Sha256};
        Self {
            registry,
            clarifications,
            api_secret_hash: api_secret.map(|s| Sha256::digest(s.as_bytes()).into()),
            sessions,
            identity,
            lifecycle,
            config,
        }
    }

    pub fn registry(&self) -> Arc<StreamRegistry> {
        self.registry.clone()
    }

    /// Constant-time bearer check: this is the sole authorization gate for
    /// `/api/*` routes, invoked as this adapter's `verify_request`. Hashing
    /// both sides avoids leaking the configured token's length through a
    /// short-circuiting string comparison.
    pub fn check_bearer(&self, authorization_header: Option<&str>) -> bool {
        use sha2::{Digest, Sha256};
        use subtle::ConstantTimeEq;

        let Some(expected_hash) = &self.api_secret_hash else {
            return true;
        };
        let provided = authorization_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .unwrap_or("");
        let provided_hash: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
        bool::from(provided_hash.ct_eq(expected_hash))
    }

    /// A per-channel override always wins; absent that, group messages are
    /// denied when `deny_groups` is set, and everything else falls back to
    /// the configured default.
    fn send_policy_allows(&self, meta: &InboundMetadata) -> bool {
        let policy = &self.config.send_policy;
        let channel_mode = meta
            .channel
            .as_deref()
            .and_then(|c| policy.channel_overrides.get(c).copied());

        if let Some(mode) = channel_mode {
            return mode == SendPolicyMode::Allow;
        }
        if !meta.is_direct && policy.deny_groups {
            return false;
        }
        policy.default == SendPolicyMode::Allow
    }
}

#[async_trait]
impl PlatformAdapter for HttpAdapter {
    async fn verify_request(&self, raw: &serde_json::Value) -> bool {
        self.check_bearer(raw["_authorization"].as_str())
    }

    async fn parse_incoming(&self, raw: &serde_json::Value) -> Result<Option<IncomingMessage>> {
        let Some(text) = raw["message"].as_str().or_else(|| raw["text"].as_str()) else {
            return Ok(None);
        };

        // A caller that already knows its routing (the `/agent/run` internal
        // route, simple API clients) can pass `platformKey` directly and skip
        // identity/lifecycle resolution entirely.
        if let Some(platform_key) = raw["platformKey"].as_str() {
            return Ok(Some(IncomingMessage {
                platform_key: platform_key.to_string(),
                memory_key: raw["memoryKey"].as_str().map(str::to_string),
                text: text.to_string(),
                force_new_session: raw["newSession"].as_bool().unwrap_or(false),
                stream_id: raw["streamId"].as_str().map(str::to_string),
            }));
        }

        // Otherwise this is a connector webhook carrying raw channel
        // metadata: resolve identity, compute the session key, and gate on
        // send policy before the message ever reaches the loop.
        let mut meta = InboundMetadata {
            channel: raw["channel"].as_str().map(str::to_string),
            account_id: raw["accountId"].as_str().map(str::to_string),
            peer_id: raw["peerId"].as_str().map(str::to_string),
            group_id: raw["groupId"].as_str().map(str::to_string),
            channel_id: raw["channelId"].as_str().map(str::to_string),
            thread_id: raw["threadId"].as_str().map(str::to_string),
            is_direct: raw["isDirect"].as_bool().unwrap_or(false),
        };
        if let Some(peer) = &meta.peer_id {
            meta.peer_id = Some(self.identity.resolve(peer));
        }

        if !self.send_policy_allows(&meta) {
            return Ok(None);
        }

        let platform_key = compute_session_key(&self.config.agent_id, self.config.dm_scope, &meta);
        let force_new_session = self
            .sessions
            .get_current(&platform_key)
            .map(|session| {
                self.lifecycle
                    .should_reset(&session, &meta, chrono::Utc::now())
                    .is_some()
            })
            .unwrap_or(false);

        Ok(Some(IncomingMessage {
            platform_key,
            memory_key: raw["memoryKey"].as_str().map(str::to_string),
            text: text.to_string(),
            force_new_session,
            stream_id: raw["streamId"].as_str().map(str::to_string),
        }))
    }

    async fn ack_request(&self, incoming: &IncomingMessage) -> AckResponse {
        AckResponse {
            stream_id: incoming
                .stream_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    async fn create_stream_handle(
        &self,
        _incoming: &IncomingMessage,
        stream_id: &str,
    ) -> Arc<dyn StreamHandle> {
        Arc::new(SseStreamHandle {
            stream_id: stream_id.to_string(),
            registry: self.registry.clone(),
        })
    }
}

struct SseStreamHandle {
    stream_id: String,
    registry: Arc<StreamRegistry>,
}

#[async_trait]
impl StreamHandle for SseStreamHandle {
    async fn on_text(&self, delta: &str) {
        self.registry.push(
            &self.stream_id,
            SseEvent::Text {
                delta: delta.to_string(),
            },
        );
    }

    async fn on_tool_call(&self, name: &str, input: &serde_json::Value) {
        self.registry.push(
            &self.stream_id,
            SseEvent::ToolCall {
                name: name.to_string(),
                input: input.clone(),
            },
        );
    }

    async fn on_clarification(&self, request: &ClarificationRequest) {
        self.registry.push(
            &self.stream_id,
            SseEvent::Clarification {
                id: request.id.clone(),
                prompt: request.prompt.clone(),
            },
        );
    }

    async fn on_done(&self, result: &str) {
        self.registry.push(
            &self.stream_id,
            SseEvent::Done {
                result: result.to_string(),
            },
        );
    }

    async fn on_error(&self, message: &str) {
        self.registry.push(
            &self.stream_id,
            SseEvent::Error {
                message: message.to_string(),
            },
        );
    }
}

/// `POST /api/clarify/{streamId}` delivers `answer` into the matching
/// outstanding clarification, if any is still open.
pub fn deliver_clarification_answer(
    clarifications: &ClarificationHub,
    stream_id: &str,
    answer: String,
) -> bool {
    clarifications.answer(stream_id, answer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_buffered_events_first() {
        let registry = StreamRegistry::new();
        registry.push("s1", SseEvent::Text { delta: "hi".to_string() });
        let (buffered, _rx) = registry.subscribe("s1");
        assert_eq!(buffered.len(), 1);
    }

    #[test]
    fn live_events_after_subscribe_reach_the_channel() {
        let registry = StreamRegistry::new();
        let (_buffered, mut rx) = registry.subscribe("s1");
        registry.push(
            "s1",
            SseEvent::Done {
                result: "done".to_string(),
            },
        );
        assert!(matches!(rx.try_recv(), Ok(SseEvent::Done { .. })));
    }

    #[test]
    fn sweep_done_drops_terminated_streams_only() {
        let registry = StreamRegistry::new();
        registry.push("finished", SseEvent::Done { result: "ok".to_string() });
        registry.push("live", SseEvent::Text { delta: "hi".to_string() });
        registry.sweep_done();
        assert_eq!(registry.streams.lock().len(), 1);
        assert!(registry.streams.lock().contains_key("live"));
    }

    fn test_adapter(api_secret: Option<String>) -> HttpAdapter {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(&dir.path().join("state.json")).unwrap());
        HttpAdapter::new(
            Arc::new(StreamRegistry::new()),
            Arc::new(ClarificationHub::new()),
            api_secret,
            sessions,
            Arc::new(IdentityResolver::from_config(&[])),
            Arc::new(LifecycleManager::new(Default::default())),
            SessionsConfig::default(),
        )
    }

    #[test]
    fn bearer_check_passes_without_configured_secret() {
        let adapter = test_adapter(None);
        assert!(adapter.check_bearer(None));
    }

    #[test]
    fn bearer_check_rejects_wrong_token() {
        let adapter = test_adapter(Some("secret".to_string()));
        assert!(!adapter.check_bearer(Some("Bearer wrong")));
        assert!(adapter.check_bearer(Some("Bearer secret")));
    }

    #[tokio::test]
    async fn group_message_denied_by_default_send_policy() {
        let adapter = test_adapter(None);
        let raw = serde_json::json!({
            "text": "hello",
            "channel": "discord",
            "groupId": "server1",
            "isDirect": false,
        });
        let parsed = adapter.parse_incoming(&raw).await.unwrap();
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn dm_message_computes_session_key_from_metadata() {
        let adapter = test_adapter(None);
        let raw = serde_json::json!({
            "text": "hello",
            "channel": "discord",
            "peerId": "alice",
            "isDirect": true,
        });
        let parsed = adapter.parse_incoming(&raw).await.unwrap().unwrap();
        assert_eq!(parsed.platform_key, "agent:agent-1:discord:dm:alice");
    }

    #[tokio::test]
    async fn channel_override_allows_group_messages() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(&dir.path().join("state.json")).unwrap());
        let mut config = SessionsConfig::default();
        config
            .send_policy
            .channel_overrides
            .insert("discord".to_string(), SendPolicyMode::Allow);
        let adapter = HttpAdapter::new(
            Arc::new(StreamRegistry::new()),
            Arc::new(ClarificationHub::new()),
            None,
            sessions,
            Arc::new(IdentityResolver::from_config(&[])),
            Arc::new(LifecycleManager::new(Default::default())),
            config,
        );
        let raw = serde_json::json!({
            "text": "hello",
            "channel": "discord",
            "groupId": "server1",
            "isDirect": false,
        });
        let parsed = adapter.parse_incoming(&raw).await.unwrap();
        assert!(parsed.is_some());
    }
}

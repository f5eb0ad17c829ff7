//! Dispatcher (C9) — the single entry point every platform adapter funnels
//! through: verify, parse, route commands, gate on busy, ack, stream, run
//! the loop, save, and always clear the active-run slot.

use std::sync::Arc;

use agentrt_domain::config::{CompactionConfig, LoopBoundsConfig};
use agentrt_domain::error::Result;
use agentrt_domain::hook::HookRegistry;
use agentrt_domain::session::ActiveRun;
use agentrt_domain::skill::SkillRegistry;
use agentrt_domain::tool::{ClarificationRequest, Message, RunContext, ToolRegistry};
use agentrt_providers::LlmProvider;
use agentrt_sessions::store::SessionStore;
use agentrt_sessions::transcript::TranscriptWriter;

use crate::platform::{IncomingMessage, PlatformAdapter, StreamHandle};
use crate::runtime::active_run::ActiveRunRegistry;
use crate::runtime::agent_loop::{run_loop, LoopOptions, LoopSink};
use crate::runtime::clarify::{self, ClarificationHub};
use crate::runtime::commands::{self, CommandContext, RouterOutcome};

/// Everything the dispatcher needs to drive a run, independent of which
/// transport the inbound message arrived on.
pub struct DispatcherDeps {
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptWriter>,
    pub active_runs: Arc<ActiveRunRegistry>,
    pub clarifications: Arc<ClarificationHub>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub loop_bounds: LoopBoundsConfig,
    pub compaction: CompactionConfig,
    pub skills: Option<Arc<dyn SkillRegistry>>,
}

/// Bridges the agent loop's `LoopSink` to a transport's `StreamHandle`,
/// routing mid-run clarifications through the shared hub so an out-of-band
/// answer (an HTTP POST, or the CLI's next line) can resolve them.
struct DispatchSink {
    stream_id: String,
    handle: Arc<dyn StreamHandle>,
    hub: Arc<ClarificationHub>,
}

#[async_trait::async_trait]
impl LoopSink for DispatchSink {
    async fn on_text(&self, delta: &str) {
        self.handle.on_text(delta).await;
    }

    async fn on_tool_call(&self, _call_id: &str, name: &str, input: &serde_json::Value) {
        self.handle.on_tool_call(name, input).await;
    }

    async fn on_tool_result(&self, _call_id: &str, name: &str, output: &serde_json::Value) {
        self.handle.on_tool_result(name, output).await;
    }

    async fn on_compacted(&self, event: &agentrt_domain::session::CompactionEvent) {
        self.handle.on_compaction(event).await;
    }

    async fn on_clarification_request(&self, request: ClarificationRequest) -> Result<String> {
        self.handle.on_clarification(&request).await;
        let rx = self.hub.register(&self.stream_id);
        let answer = async move {
            rx.await
                .map_err(|_| agentrt_domain::error::Error::Other("clarification channel closed".into()))
        };
        let result = clarify::resolve_with_timeout(&request, answer).await;
        self.hub.cancel(&self.stream_id);
        result
    }
}

fn busy_reply(result: &str) -> &str {
    result
}

/// Run one inbound message through verify -> parse -> route -> busy-gate ->
/// ack -> stream -> loop -> save, per the ten-step algorithm this type is
/// named for. Errors returned here are transport-level failures (a parse
/// error, an auth rejection); everything that happens after the busy gate
/// reports through the stream handle instead, since by that point the
/// caller has already been acked.
pub async fn dispatch(
    adapter: &dyn PlatformAdapter,
    raw: &serde_json::Value,
    deps: &DispatcherDeps,
) -> Result<()> {
    if !adapter.verify_request(raw).await {
        return Err(agentrt_domain::error::Error::Auth(
            "request verification failed".to_string(),
        ));
    }

    let Some(incoming) = adapter.parse_incoming(raw).await? else {
        // Heartbeat, dedup, or a clarification answer the adapter already
        // routed itself; nothing further to do.
        return Ok(());
    };

    let command_ctx = CommandContext {
        platform_key: &incoming.platform_key,
        sessions: &deps.sessions,
        active_runs: &deps.active_runs,
        skills: deps.skills.clone(),
        provider: Some(deps.provider.clone()),
        compaction: &deps.compaction,
    };

    let text = match commands::route(&incoming.text, &command_ctx).await {
        RouterOutcome::None => incoming.text.clone(),
        RouterOutcome::Transformed(rewritten) => rewritten,
        RouterOutcome::Handled(message) => {
            return finish_without_loop(adapter, &incoming, &message).await;
        }
        RouterOutcome::HandledSilent => return Ok(()),
    };

    if deps.active_runs.has_active_run(&incoming.platform_key) {
        return finish_without_loop(
            adapter,
            &incoming,
            busy_reply("A run is already in progress. Use /stop to cancel it."),
        )
        .await;
    }

    let stream_id = incoming
        .stream_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let run = ActiveRun::new(stream_id.clone(), incoming.platform_key.clone());
    let cancel = run.cancel.clone();
    if !deps.active_runs.set_active_run(run) {
        return finish_without_loop(
            adapter,
            &incoming,
            busy_reply("A run is already in progress. Use /stop to cancel it."),
        )
        .await;
    }

    adapter.ack_request(&incoming).await;
    let handle = adapter.create_stream_handle(&incoming, &stream_id).await;

    let (mut session, _is_new) = deps
        .sessions
        .get_or_create(&incoming.platform_key, incoming.force_new_session);
    session.context.push(Message::user(text.clone()));
    let run_user_text = text.clone();

    let sink: Arc<dyn LoopSink> = Arc::new(DispatchSink {
        stream_id: stream_id.clone(),
        handle: handle.clone(),
        hub: deps.clarifications.clone(),
    });

    let options = LoopOptions {
        sink,
        cancel,
        tools: deps.tools.clone(),
        hooks: deps.hooks.clone(),
        provider: deps.provider.clone(),
        model: deps.model.clone(),
        system_prompt: deps.system_prompt.clone(),
        loop_bounds: deps.loop_bounds.clone(),
        compaction: deps.compaction.clone(),
        run_context: RunContext {
            platform_key: incoming.platform_key.clone(),
            session_id: session.session_id.clone(),
            user_text: text,
        },
    };

    let result = run_loop(&mut session.context, options).await;

    if let Err(e) = deps.sessions.save(&session.session_id, session.context.clone()) {
        tracing::error!(error = %e, session_id = %session.session_id, "failed to save session after run");
    }

    let transcript_lines = [
        TranscriptWriter::line("user", &run_user_text),
        TranscriptWriter::line("assistant", &result),
    ];
    if let Err(e) = deps.transcripts.append(&session.session_id, &transcript_lines) {
        tracing::error!(error = %e, session_id = %session.session_id, "failed to append transcript");
    }

    handle.on_done(&result).await;
    deps.clarifications.cancel(&stream_id);
    deps.active_runs.clear_active_run(&incoming.platform_key);
    Ok(())
}

/// Common tail for every path that short-circuits before the loop runs: a
/// command reply or a busy-gate rejection still needs an ack and a stream.
async fn finish_without_loop(
    adapter: &dyn PlatformAdapter,
    incoming: &IncomingMessage,
    message: &str,
) -> Result<()> {
    let stream_id = incoming
        .stream_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    adapter.ack_request(incoming).await;
    let handle = adapter.create_stream_handle(incoming, &stream_id).await;
    handle.on_done(message).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_domain::capability::LlmCapabilities;
    use agentrt_domain::config::{CompactionConfig, LoopBoundsConfig};
    use agentrt_domain::hook::HookRegistry;
    use agentrt_domain::stream::{BoxStream, StreamEvent};
    use agentrt_domain::tool::ToolRegistry;
    use agentrt_providers::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse};
    use async_trait::async_trait;
    use parking_lot::Mutex as StdMutex;

    struct StubProvider {
        capabilities: LlmCapabilities,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                capabilities: LlmCapabilities::default(),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: "hi there".to_string(),
                tool_calls: vec![],
                usage: None,
                model: "test".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }

        async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            Ok(Box::pin(futures_util::stream::iter(vec![Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".to_string()),
            })])))
        }

        async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
            Ok(EmbeddingsResponse { embeddings: vec![] })
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            "stub"
        }
    }

    struct RecordingHandle {
        texts: StdMutex<Vec<String>>,
        done: StdMutex<Option<String>>,
    }

    impl RecordingHandle {
        fn new() -> Self {
            Self {
                texts: StdMutex::new(Vec::new()),
                done: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StreamHandle for RecordingHandle {
        async fn on_text(&self, delta: &str) {
            self.texts.lock().push(delta.to_string());
        }
        async fn on_tool_call(&self, _name: &str, _input: &serde_json::Value) {}
        async fn on_clarification(&self, _request: &ClarificationRequest) {}
        async fn on_done(&self, result: &str) {
            *self.done.lock() = Some(result.to_string());
        }
        async fn on_error(&self, _message: &str) {}
    }

    struct FakeAdapter {
        handles: StdMutex<Vec<Arc<RecordingHandle>>>,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                handles: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for FakeAdapter {
        async fn verify_request(&self, _raw: &serde_json::Value) -> bool {
            true
        }

        async fn parse_incoming(
            &self,
            raw: &serde_json::Value,
        ) -> Result<Option<IncomingMessage>> {
            Ok(Some(IncomingMessage {
                platform_key: raw["platform_key"].as_str().unwrap_or("web:u1").to_string(),
                memory_key: None,
                text: raw["text"].as_str().unwrap_or("").to_string(),
                force_new_session: false,
                stream_id: None,
            }))
        }

        async fn ack_request(&self, incoming: &IncomingMessage) -> crate::platform::AckResponse {
            crate::platform::AckResponse {
                stream_id: incoming.stream_id.clone().unwrap_or_default(),
            }
        }

        async fn create_stream_handle(
            &self,
            _incoming: &IncomingMessage,
            _stream_id: &str,
        ) -> Arc<dyn StreamHandle> {
            let handle = Arc::new(RecordingHandle::new());
            self.handles.lock().push(handle.clone());
            handle
        }
    }

    fn deps() -> (DispatcherDeps, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sessions = Arc::new(SessionStore::new(&dir.path().join("state.json")).unwrap());
        let transcripts = Arc::new(TranscriptWriter::new(&dir.path().join("transcripts")));
        (
            DispatcherDeps {
                sessions,
                transcripts,
                active_runs: Arc::new(ActiveRunRegistry::new()),
                clarifications: Arc::new(ClarificationHub::new()),
                tools: Arc::new(ToolRegistry::default()),
                hooks: Arc::new(HookRegistry::default()),
                provider: Arc::new(StubProvider::new()),
                model: None,
                system_prompt: None,
                loop_bounds: LoopBoundsConfig::default(),
                compaction: CompactionConfig::default(),
                skills: None,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn plain_message_runs_loop_and_saves_session() {
        let (deps, _dir) = deps();
        let adapter = FakeAdapter::new();
        let raw = serde_json::json!({"platform_key": "web:u1", "text": "hello"});

        dispatch(&adapter, &raw, &deps).await.unwrap();

        assert!(!deps.active_runs.has_active_run("web:u1"));
        let session = deps.sessions.get_current("web:u1").unwrap();
        assert_eq!(session.message_count(), 2);
        let handles = adapter.handles.lock();
        assert_eq!(handles.len(), 1);
        assert!(handles[0].done.lock().is_some());

        let lines = deps.transcripts.read(&session.session_id).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].role, "user");
        assert_eq!(lines[1].role, "assistant");
    }

    #[tokio::test]
    async fn command_text_never_touches_the_loop() {
        let (deps, _dir) = deps();
        let adapter = FakeAdapter::new();
        let raw = serde_json::json!({"platform_key": "web:u1", "text": "/help"});

        dispatch(&adapter, &raw, &deps).await.unwrap();

        assert!(deps.sessions.get_current("web:u1").is_none());
        let handles = adapter.handles.lock();
        assert!(handles[0].done.lock().as_deref().unwrap().contains("Commands"));
    }

    #[tokio::test]
    async fn busy_platform_key_is_rejected_without_running_loop() {
        let (deps, _dir) = deps();
        deps.active_runs
            .set_active_run(ActiveRun::new("existing", "web:u1"));
        let adapter = FakeAdapter::new();
        let raw = serde_json::json!({"platform_key": "web:u1", "text": "hello again"});

        dispatch(&adapter, &raw, &deps).await.unwrap();

        let handles = adapter.handles.lock();
        assert!(handles[0]
            .done
            .lock()
            .as_deref()
            .unwrap()
            .contains("already in progress"));
        assert!(deps.sessions.get_current("web:u1").is_none());
    }

    #[tokio::test]
    async fn verification_failure_short_circuits_before_parse() {
        struct RejectAll;
        #[async_trait]
        impl PlatformAdapter for RejectAll {
            async fn verify_request(&self, _raw: &serde_json::Value) -> bool {
                false
            }
            async fn parse_incoming(
                &self,
                _raw: &serde_json::Value,
            ) -> Result<Option<IncomingMessage>> {
                panic!("must not be called after verify fails");
            }
            async fn ack_request(&self, incoming: &IncomingMessage) -> crate::platform::AckResponse {
                crate::platform::AckResponse {
                    stream_id: incoming.stream_id.clone().unwrap_or_default(),
                }
            }
            async fn create_stream_handle(
                &self,
                _incoming: &IncomingMessage,
                _stream_id: &str,
            ) -> Arc<dyn StreamHandle> {
                Arc::new(RecordingHandle::new())
            }
        }

        let (deps, _dir) = deps();
        let raw = serde_json::json!({});
        let err = dispatch(&RejectAll, &raw, &deps).await.unwrap_err();
        assert!(matches!(err, agentrt_domain::error::Error::Auth(_)));
    }
}

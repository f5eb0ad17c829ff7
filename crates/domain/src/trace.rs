use serde::Serialize;

/// Structured lifecycle events emitted across the runtime, logged via
/// `tracing` as a single JSON field rather than scattered ad-hoc fields.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionResolved {
        platform_key: String,
        session_id: String,
        is_new: bool,
    },
    SessionReset {
        platform_key: String,
        old_session_id: String,
        new_session_id: String,
        reason: String,
    },
    RunStarted {
        platform_key: String,
        stream_id: String,
    },
    RunCompleted {
        platform_key: String,
        stream_id: String,
        total_steps: u32,
        error_count: u32,
        compaction_attempts: u32,
    },
    CompactionPerformed {
        platform_key: String,
        strategy: String,
        before_tokens: usize,
        after_tokens: usize,
    },
    ToolDispatched {
        platform_key: String,
        tool_name: String,
        call_id: String,
    },
    HookInvoked {
        hook_name: String,
        ok: bool,
    },
    ClarificationRequested {
        run_id: String,
        clarification_id: String,
    },
    IdentityResolved {
        raw_peer_id: String,
        canonical: String,
    },
    TranscriptAppend {
        session_id: String,
        lines: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "agent_event");
    }
}

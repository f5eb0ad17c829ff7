//! Context, Session, ActiveRun, and CompactionEvent — the core data model
//! of §3 in the spec.

use crate::cancel::CancelToken;
use crate::tool::{Message, RunContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The living message list of one conversation. Created lazily on first
/// user message, mutated only by appends or a wholesale compactor
/// replacement, destroyed only when the session is cleared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    pub messages: Vec<Message>,
    #[serde(skip)]
    pub cancel: Option<CancelToken>,
    #[serde(skip)]
    pub run: Option<RunContext>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// A named, resumable Context, owned exclusively by the session store while
/// it is current for its platformKey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub platform_key: String,
    pub context: Context,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, platform_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            platform_key: platform_key.into(),
            context: Context::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn message_count(&self) -> usize {
        self.context.messages.len()
    }

    /// First user message's text (or canonical stringification of
    /// structured content), truncated to 80 characters — the session
    /// preview shown by `/resume` and `/sessions`.
    pub fn preview(&self) -> String {
        let text = self
            .context
            .messages
            .iter()
            .find(|m| m.role == crate::tool::Role::User)
            .map(|m| m.content.extract_all_text())
            .unwrap_or_default();
        truncate_preview(&text, 80)
    }
}

/// Truncate `text` to at most `max_chars` characters, appending an ellipsis
/// when truncated (the ellipsis counts toward the limit).
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let keep = max_chars.saturating_sub(1);
    let truncated: String = text.chars().take(keep).collect();
    format!("{truncated}\u{2026}")
}

/// An in-flight agent execution, owned exclusively by the active-run
/// registry (C8).
#[derive(Clone)]
pub struct ActiveRun {
    pub stream_id: String,
    pub cancel: CancelToken,
    pub started_at: DateTime<Utc>,
    pub platform_key: String,
}

impl ActiveRun {
    pub fn new(stream_id: impl Into<String>, platform_key: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            cancel: CancelToken::new(),
            started_at: Utc::now(),
            platform_key: platform_key.into(),
        }
    }
}

/// Why a compaction attempt was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionTrigger {
    PreLoop,
    LengthRetry,
}

/// Which strategy a compaction ultimately used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategy {
    Summary,
    SummaryTooLarge,
    Fallback,
}

/// A record of one compaction attempt, emitted to the `onCompacted`
/// callback and hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEvent {
    pub attempt: u32,
    pub trigger: CompactionTrigger,
    pub strategy: CompactionStrategy,
    pub forced: bool,
    pub before_message_count: usize,
    pub after_message_count: usize,
    pub before_estimated_tokens: usize,
    pub after_estimated_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Message;

    #[test]
    fn preview_truncates_at_80_chars_with_ellipsis() {
        let long = "x".repeat(100);
        let truncated = truncate_preview(&long, 80);
        assert_eq!(truncated.chars().count(), 80);
        assert!(truncated.ends_with('\u{2026}'));
    }

    #[test]
    fn preview_passes_through_short_text() {
        assert_eq!(truncate_preview("hi", 80), "hi");
    }

    #[test]
    fn session_preview_uses_first_user_message() {
        let mut session = Session::new("s1", "web:u1");
        session.context.push(Message::system("sys"));
        session.context.push(Message::user("hello there"));
        session.context.push(Message::assistant("hi"));
        assert_eq!(session.preview(), "hello there");
    }

    #[test]
    fn session_preview_empty_when_no_user_message() {
        let session = Session::new("s1", "web:u1");
        assert_eq!(session.preview(), "");
    }

    #[test]
    fn context_is_cancelled_reflects_token() {
        let mut ctx = Context::new();
        assert!(!ctx.is_cancelled());
        let token = CancelToken::new();
        token.cancel();
        ctx.cancel = Some(token);
        assert!(ctx.is_cancelled());
    }
}

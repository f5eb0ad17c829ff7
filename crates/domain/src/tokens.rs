//! Deterministic, model-agnostic token estimation (C1).
//!
//! Not a tokenizer — a fast upper-bound estimate used only for threshold
//! comparisons against the compaction trigger/target. No provider's actual
//! tokenizer is consulted.

use crate::tool::{Message, MessageContent};

/// Estimate the token count of a single message: role name length plus
/// content length (chars, or canonical JSON length for structured content),
/// divided by 4 and rounded up.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let role_len = role_name(message).len();
    let content_len = match &message.content {
        MessageContent::Text(text) => text.chars().count(),
        MessageContent::Parts(parts) => serde_json::to_string(parts)
            .map(|s| s.chars().count())
            .unwrap_or(0),
    };
    div_ceil(role_len + content_len, 4)
}

/// Estimate the total token count across a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

fn role_name(message: &Message) -> &'static str {
    match message.role {
        crate::tool::Role::System => "system",
        crate::tool::Role::User => "user",
        crate::tool::Role::Assistant => "assistant",
        crate::tool::Role::Tool => "tool",
    }
}

fn div_ceil(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

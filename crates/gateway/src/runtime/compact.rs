//! Context compactor (C2) — collapses a prefix of a Context's messages into
//! a short summary so the estimated token count stays under budget.
//!
//! Never mutates the caller's Context directly: returns either
//! `DidNotCompact` or `Compacted{messages, event}` and leaves the decision
//! of whether/how to apply it to the agent loop.

use agentrt_domain::config::CompactionConfig;
use agentrt_domain::session::{CompactionEvent, CompactionStrategy, CompactionTrigger, Context};
use agentrt_domain::tokens::estimate_messages_tokens;
use agentrt_domain::tool::{Message, Role};
use agentrt_providers::traits::ChatRequest;
use agentrt_providers::LlmProvider;

/// Literal tag prepended to every compaction summary.
pub const COMPACTED_TAG: &str = "[COMPACTED_CONTEXT]";

const SUMMARY_SYSTEM_PROMPT: &str = "You summarize prior conversation turns for an AI agent \
resuming the task. Produce a concise, bounded-length summary as a bullet list under these \
headers: Goal, Decisions, Open questions, Facts, Tool state. Omit headers with nothing to say. \
Do not include pleasantries.";

pub enum CompactionOutcome {
    DidNotCompact,
    Compacted {
        messages: Vec<Message>,
        event: CompactionEvent,
    },
}

/// Run one compaction attempt against `context`.
///
/// `attempt` is the 1-based attempt number within the current loop run, used
/// only to populate the returned event.
pub async fn compact(
    context: &Context,
    force: bool,
    trigger: CompactionTrigger,
    attempt: u32,
    provider: &dyn LlmProvider,
    config: &CompactionConfig,
) -> CompactionOutcome {
    let messages = &context.messages;
    if messages.is_empty() {
        return CompactionOutcome::DidNotCompact;
    }

    let before_tokens = estimate_messages_tokens(messages);
    if !force && before_tokens < config.trigger_tokens() {
        return CompactionOutcome::DidNotCompact;
    }

    let (mut old, mut recent) = split_by_turns(messages, config.keep_last_turns);

    if old.is_empty() {
        if !force {
            return CompactionOutcome::DidNotCompact;
        }
        let (old1, recent1) = split_by_turns(messages, 1);
        old = old1;
        recent = recent1;
        if old.is_empty() {
            if messages.len() <= 1 {
                return CompactionOutcome::DidNotCompact;
            }
            old = messages[..messages.len() - 1].to_vec();
            recent = messages[messages.len() - 1..].to_vec();
        }
    }

    match summarize(provider, &old, config).await {
        Ok(summary) if !summary.trim().is_empty() => {
            let tagged = tag_summary(&summary);
            let mut next = Vec::with_capacity(1 + recent.len());
            next.push(Message::assistant(tagged));
            next.extend(recent.iter().cloned());
            let after_tokens = estimate_messages_tokens(&next);

            if after_tokens <= config.target_tokens() && after_tokens < before_tokens {
                let reason = if force { "force-summary" } else { "summary" };
                let event = make_event(
                    attempt,
                    trigger,
                    CompactionStrategy::Summary,
                    force,
                    messages.len(),
                    next.len(),
                    before_tokens,
                    after_tokens,
                    reason,
                );
                return CompactionOutcome::Compacted {
                    messages: next,
                    event,
                };
            }

            fallback(
                messages,
                config,
                before_tokens,
                attempt,
                trigger,
                force,
                CompactionStrategy::SummaryTooLarge,
                "summary-too-large",
            )
        }
        _ => fallback(
            messages,
            config,
            before_tokens,
            attempt,
            trigger,
            force,
            CompactionStrategy::Fallback,
            "fallback",
        ),
    }
}

fn tag_summary(summary: &str) -> String {
    if summary.contains(COMPACTED_TAG) {
        summary.to_string()
    } else {
        format!("{COMPACTED_TAG}\n{summary}")
    }
}

#[allow(clippy::too_many_arguments)]
fn make_event(
    attempt: u32,
    trigger: CompactionTrigger,
    strategy: CompactionStrategy,
    forced: bool,
    before_message_count: usize,
    after_message_count: usize,
    before_estimated_tokens: usize,
    after_estimated_tokens: usize,
    reason: &str,
) -> CompactionEvent {
    CompactionEvent {
        attempt,
        trigger,
        strategy,
        forced,
        before_message_count,
        after_message_count,
        before_estimated_tokens,
        after_estimated_tokens,
        reason: Some(reason.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn fallback(
    messages: &[Message],
    config: &CompactionConfig,
    before_tokens: usize,
    attempt: u32,
    trigger: CompactionTrigger,
    forced: bool,
    strategy: CompactionStrategy,
    reason: &str,
) -> CompactionOutcome {
    let pruned = prune(messages);
    let (_, recent) = split_by_turns(&pruned, config.keep_last_turns);
    let after_tokens = estimate_messages_tokens(&recent);

    if after_tokens < before_tokens {
        let event = make_event(
            attempt,
            trigger,
            strategy,
            forced,
            messages.len(),
            recent.len(),
            before_tokens,
            after_tokens,
            reason,
        );
        CompactionOutcome::Compacted {
            messages: recent,
            event,
        }
    } else {
        CompactionOutcome::DidNotCompact
    }
}

/// Split `messages` at the boundary of the `keep_last_turns`-th-from-last
/// user turn. Returns `(old_prefix, recent_suffix)`. If there are not more
/// than `keep_last_turns` user turns, `old_prefix` is empty.
fn split_by_turns(messages: &[Message], keep_last_turns: usize) -> (Vec<Message>, Vec<Message>) {
    let user_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    if user_indices.len() <= keep_last_turns || keep_last_turns == 0 {
        return (Vec::new(), messages.to_vec());
    }

    let cut = user_indices[user_indices.len() - keep_last_turns];
    (messages[..cut].to_vec(), messages[cut..].to_vec())
}

/// Drop reasoning-only, tool-call-only, tool-result, and text-empty
/// messages, keeping only substantive user/assistant/system turns.
fn prune(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.role != Role::Tool && !m.content.extract_all_text().trim().is_empty())
        .cloned()
        .collect()
}

async fn summarize(
    provider: &dyn LlmProvider,
    old_messages: &[Message],
    config: &CompactionConfig,
) -> agentrt_domain::error::Result<String> {
    let conversation = render_conversation(old_messages);
    let req = ChatRequest {
        messages: vec![
            Message::system(SUMMARY_SYSTEM_PROMPT),
            Message::user(conversation),
        ],
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(config.summary_max_tokens as u32),
        json_mode: false,
        model: None,
    };
    let resp = provider.chat(req).await?;
    Ok(resp.content)
}

fn render_conversation(messages: &[Message]) -> String {
    let mut buf = String::new();
    for m in messages {
        let label = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let text = m.content.extract_all_text();
        buf.push_str(label);
        buf.push_str(": ");
        if text.len() > 2000 {
            buf.push_str(&text[..floor_char_boundary(&text, 1000)]);
            buf.push_str(" [...] ");
            buf.push_str(&text[ceil_char_boundary(&text, text.len() - 500)..]);
        } else {
            buf.push_str(&text);
        }
        buf.push('\n');
    }
    buf
}

/// Largest byte index `<= idx` that lands on a UTF-8 char boundary.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest byte index `>= idx` that lands on a UTF-8 char boundary.
fn ceil_char_boundary(s: &str, idx: usize) -> usize {
    let mut idx = idx.min(s.len());
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(keep_last_turns: usize) -> CompactionConfig {
        CompactionConfig {
            context_window_tokens: 1000,
            compact_trigger: Some(100),
            compact_target: Some(50),
            keep_last_turns,
            max_compaction_attempts: 2,
            summary_max_tokens: 200,
        }
    }

    fn turns(n: usize) -> Vec<Message> {
        (0..n)
            .flat_map(|i| {
                vec![
                    Message::user(format!("question {i}")),
                    Message::assistant(format!("answer {i}")),
                ]
            })
            .collect()
    }

    #[test]
    fn split_keeps_last_n_user_turns() {
        let messages = turns(5);
        let (old, recent) = split_by_turns(&messages, 2);
        let recent_users: Vec<_> = recent
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.extract_all_text())
            .collect();
        assert_eq!(recent_users, vec!["question 3", "question 4"]);
        assert!(!old.is_empty());
    }

    #[test]
    fn split_with_few_turns_keeps_all() {
        let messages = turns(2);
        let (old, recent) = split_by_turns(&messages, 6);
        assert!(old.is_empty());
        assert_eq!(recent.len(), messages.len());
    }

    #[test]
    fn prune_drops_tool_and_empty_messages() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant_tool_call("c1", "search", serde_json::json!({})),
            Message::tool_result("c1", "result"),
            Message::assistant("final answer"),
        ];
        let pruned = prune(&messages);
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].content.extract_all_text(), "hi");
        assert_eq!(pruned[1].content.extract_all_text(), "final answer");
    }

    #[test]
    fn tag_summary_prepends_once() {
        assert_eq!(tag_summary("body"), "[COMPACTED_CONTEXT]\nbody");
        let already = format!("{COMPACTED_TAG}\nbody");
        assert_eq!(tag_summary(&already), already);
    }

    #[test]
    fn render_conversation_truncates_on_char_boundaries() {
        // A run of 3-byte multi-byte characters around both truncation
        // points; a naive byte-offset slice would panic here.
        let long_text = "\u{4e2d}".repeat(1000);
        let messages = vec![Message::user(long_text)];
        let rendered = render_conversation(&messages);
        assert!(rendered.contains("[...]"));
    }

    #[tokio::test]
    async fn empty_context_does_not_compact() {
        let ctx = Context::new();
        let provider = NeverCalledProvider;
        let outcome = compact(
            &ctx,
            false,
            CompactionTrigger::PreLoop,
            1,
            &provider,
            &cfg(6),
        )
        .await;
        assert!(matches!(outcome, CompactionOutcome::DidNotCompact));
    }

    #[tokio::test]
    async fn below_trigger_does_not_compact() {
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));
        let provider = NeverCalledProvider;
        let config = CompactionConfig {
            compact_trigger: Some(1_000_000),
            ..cfg(6)
        };
        let outcome = compact(&ctx, false, CompactionTrigger::PreLoop, 1, &provider, &config).await;
        assert!(matches!(outcome, CompactionOutcome::DidNotCompact));
    }

    /// A provider stub that panics if called, used to assert the
    /// below-trigger short-circuit never reaches the LLM.
    struct NeverCalledProvider;

    #[async_trait::async_trait]
    impl LlmProvider for NeverCalledProvider {
        async fn chat(
            &self,
            _req: ChatRequest,
        ) -> agentrt_domain::error::Result<agentrt_providers::traits::ChatResponse> {
            panic!("provider should not be called")
        }
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> agentrt_domain::error::Result<
            agentrt_domain::stream::BoxStream<
                'static,
                agentrt_domain::error::Result<agentrt_domain::stream::StreamEvent>,
            >,
        > {
            panic!("provider should not be called")
        }
        async fn embeddings(
            &self,
            _req: agentrt_providers::traits::EmbeddingsRequest,
        ) -> agentrt_domain::error::Result<agentrt_providers::traits::EmbeddingsResponse> {
            panic!("provider should not be called")
        }
        fn capabilities(&self) -> &agentrt_domain::capability::LlmCapabilities {
            unimplemented!()
        }
        fn provider_id(&self) -> &str {
            "never-called"
        }
    }
}

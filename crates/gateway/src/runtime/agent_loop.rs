//! Agent loop (C6) — the bounded state machine that drives one run: compact,
//! call the model, dispatch tool calls, repeat until a terminal finish
//! reason, a bounds violation, or cancellation.

use std::sync::Arc;
use std::time::Duration;

use agentrt_domain::cancel::CancelToken;
use agentrt_domain::config::{CompactionConfig, LoopBoundsConfig};
use agentrt_domain::error::{Error, Result};
use agentrt_domain::hook::HookRegistry;
use agentrt_domain::session::{CompactionEvent, CompactionTrigger, Context};
use agentrt_domain::stream::StreamEvent;
use agentrt_domain::tool::{
    validate_input, ClarificationRequest, ClarificationSink, ContentPart, Message, MessageContent,
    Role, RunContext, ToolCtx, ToolRegistry,
};
use agentrt_providers::traits::ChatRequest;
use agentrt_providers::LlmProvider;
use futures_util::StreamExt;

use crate::runtime::compact::{compact, CompactionOutcome};

/// Observer callbacks the dispatcher wires to the platform's stream sink.
/// All methods are best-effort notifications; none may abort the run.
#[async_trait::async_trait]
pub trait LoopSink: Send + Sync {
    async fn on_text(&self, _delta: &str) {}
    async fn on_tool_call(&self, _call_id: &str, _name: &str, _input: &serde_json::Value) {}
    async fn on_tool_result(&self, _call_id: &str, _name: &str, _output: &serde_json::Value) {}
    async fn on_response(&self, _messages: &[Message]) {}
    async fn on_compacted(&self, _event: &CompactionEvent) {}

    /// Routes a mid-run clarification request to the platform and awaits an
    /// answer. The default rejects every request (used by adapters, such as
    /// the internal `/agent/run` route with `askPolicy=never`, that carry no
    /// interactive channel).
    async fn on_clarification_request(&self, request: ClarificationRequest) -> Result<String> {
        Err(Error::Other(format!(
            "clarification not supported (id={})",
            request.id
        )))
    }
}

struct ClarifyAdapter(Arc<dyn LoopSink>);

#[async_trait::async_trait]
impl ClarificationSink for ClarifyAdapter {
    async fn ask(&self, request: ClarificationRequest) -> Result<String> {
        self.0.on_clarification_request(request).await
    }
}

pub struct LoopOptions {
    pub sink: Arc<dyn LoopSink>,
    pub cancel: CancelToken,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    pub provider: Arc<dyn LlmProvider>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub loop_bounds: LoopBoundsConfig,
    pub compaction: CompactionConfig,
    pub run_context: RunContext,
}

/// Run the agent loop to completion, mutating `ctx` in place and returning
/// the final user-visible text.
pub async fn run_loop(ctx: &mut Context, opts: LoopOptions) -> String {
    ctx.cancel = Some(opts.cancel.clone());
    ctx.run = Some(opts.run_context.clone());

    let before_run = opts.hooks.run_before_run(&ctx.messages).await;
    let mut system_prompt = before_run.system_prompt.or_else(|| opts.system_prompt.clone());
    let mut tool_defs_override = before_run.tools;

    let clarify: Arc<dyn ClarificationSink> = Arc::new(ClarifyAdapter(opts.sink.clone()));

    let mut error_count: u32 = 0;
    let mut total_steps: u32 = 0;
    let mut compaction_attempts: u32 = 0;

    let max_error_count = opts.loop_bounds.max_error_count;
    let max_steps = opts.loop_bounds.max_steps;
    let max_compaction_attempts = opts.compaction.max_compaction_attempts;

    let result: String = 'iteration: loop {
        // 1. Cancellation check.
        if opts.cancel.is_cancelled() {
            break 'iteration "Request aborted.".to_string();
        }

        // 2. Pre-loop compaction (not forced).
        if compaction_attempts < max_compaction_attempts {
            let outcome = compact(
                ctx,
                false,
                CompactionTrigger::PreLoop,
                compaction_attempts + 1,
                opts.provider.as_ref(),
                &opts.compaction,
            )
            .await;
            if let CompactionOutcome::Compacted { messages, event } = outcome {
                compaction_attempts += 1;
                ctx.messages = messages;
                opts.sink.on_compacted(&event).await;
                opts.hooks.run_on_compacted(&event).await;
                continue 'iteration;
            }
        }

        // 3. beforeLLMCall hooks.
        let before_call = opts.hooks.run_before_llm_call(&ctx.messages).await;
        if before_call.system_prompt.is_some() {
            system_prompt = before_call.system_prompt;
        }
        if before_call.tools.is_some() {
            tool_defs_override = before_call.tools;
        }
        let tool_defs = tool_defs_override
            .clone()
            .unwrap_or_else(|| opts.tools.definitions());

        let mut req_messages = Vec::with_capacity(ctx.messages.len() + 1);
        if let Some(sp) = &system_prompt {
            req_messages.push(Message::system(sp.clone()));
        }
        req_messages.extend(ctx.messages.iter().cloned());

        let req = ChatRequest {
            messages: req_messages,
            tools: tool_defs,
            temperature: None,
            max_tokens: None,
            json_mode: false,
            model: opts.model.clone(),
        };

        // 4. Start the stream.
        let mut stream = match opts.provider.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => match handle_error(&e, &mut error_count, max_error_count, &opts.cancel).await
            {
                ErrorAction::Return(msg) => break 'iteration msg,
                ErrorAction::Retry => continue 'iteration,
            },
        };

        let mut text = String::new();
        let mut steps_this_call: u32 = 0;
        let mut finish_reason: Option<String> = None;
        let mut pending_tool_calls: Vec<(String, String, serde_json::Value)> = Vec::new();
        let mut stream_error: Option<Error> = None;

        while let Some(event) = stream.next().await {
            if opts.cancel.is_cancelled() {
                break;
            }
            match event {
                Ok(StreamEvent::Token { text: delta }) => {
                    opts.sink.on_text(&delta).await;
                    text.push_str(&delta);
                }
                Ok(StreamEvent::Thinking { .. }) => {}
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    opts.sink.on_tool_call(&call_id, &tool_name, &arguments).await;
                    pending_tool_calls.push((call_id, tool_name, arguments));
                }
                Ok(StreamEvent::ToolCallStarted { .. }) | Ok(StreamEvent::ToolCallDelta { .. }) => {}
                Ok(StreamEvent::ToolResult { .. }) => {
                    // Providers in this deployment never execute tools
                    // themselves (C4 dispatch happens below); ignored if seen.
                }
                Ok(StreamEvent::StepFinish { .. }) => {
                    steps_this_call += 1;
                }
                Ok(StreamEvent::Done {
                    usage: _,
                    finish_reason: fr,
                }) => {
                    finish_reason = fr;
                }
                Ok(StreamEvent::Error { message }) => {
                    stream_error = Some(Error::Provider {
                        provider: opts.provider.provider_id().to_string(),
                        message,
                    });
                }
                Err(e) => {
                    stream_error = Some(e);
                }
            }
        }

        // Cancellation observed mid-stream: abort without a second call.
        if opts.cancel.is_cancelled() {
            break 'iteration "Request aborted.".to_string();
        }

        if let Some(e) = stream_error {
            match handle_error(&e, &mut error_count, max_error_count, &opts.cancel).await {
                ErrorAction::Return(msg) => break 'iteration msg,
                ErrorAction::Retry => continue 'iteration,
            }
        }

        total_steps += steps_this_call;

        // 6. afterLLMCall hooks.
        opts.hooks
            .run_after_llm_call(finish_reason.as_deref().unwrap_or(""))
            .await;

        // 7. Dispatch on finishReason.
        match finish_reason.as_deref() {
            Some("stop") => {
                if text.trim().is_empty() {
                    total_steps += 1;
                    if total_steps >= max_steps {
                        break 'iteration
                            "Max steps reached, task may be incomplete.".to_string();
                    }
                    continue 'iteration;
                }
                let msg = Message::assistant(text.clone());
                ctx.push(msg.clone());
                opts.sink.on_response(std::slice::from_ref(&msg)).await;
                break 'iteration text;
            }
            Some("length") => {
                if compaction_attempts < max_compaction_attempts {
                    let outcome = compact(
                        ctx,
                        true,
                        CompactionTrigger::LengthRetry,
                        compaction_attempts + 1,
                        opts.provider.as_ref(),
                        &opts.compaction,
                    )
                    .await;
                    if let CompactionOutcome::Compacted { messages, event } = outcome {
                        compaction_attempts += 1;
                        ctx.messages = messages;
                        opts.sink.on_compacted(&event).await;
                        opts.hooks.run_on_compacted(&event).await;
                        continue 'iteration;
                    }
                }
                break 'iteration non_empty_or(&text, "Context limit reached.");
            }
            Some("content-filter") => {
                break 'iteration non_empty_or(&text, "Content filtered.");
            }
            Some("error") => {
                break 'iteration non_empty_or(&text, "Task failed.");
            }
            Some("tool-calls") => {
                if total_steps >= max_steps {
                    break 'iteration non_empty_or(
                        &text,
                        "Max steps reached, task may be incomplete.",
                    );
                }
                total_steps += 1;

                let assistant_msg = build_assistant_message(&text, &pending_tool_calls);
                let mut new_messages = vec![assistant_msg.clone()];
                ctx.push(assistant_msg);

                for (call_id, name, input) in &pending_tool_calls {
                    if opts.cancel.is_cancelled() {
                        break 'iteration "Request aborted.".to_string();
                    }
                    let output = dispatch_tool_call(
                        call_id,
                        name,
                        input.clone(),
                        opts.tools.as_ref(),
                        opts.hooks.as_ref(),
                        &opts.cancel,
                        &opts.run_context,
                        clarify.clone(),
                    )
                    .await;
                    opts.sink.on_tool_result(call_id, name, &output).await;
                    let tool_msg = Message::tool_result(call_id, output.to_string());
                    new_messages.push(tool_msg.clone());
                    ctx.push(tool_msg);
                }

                opts.sink.on_response(&new_messages).await;
                continue 'iteration;
            }
            _ => {
                break 'iteration non_empty_or(&text, "Task completed.");
            }
        }
    };

    opts.hooks.run_after_run(&result).await;
    result
}

fn non_empty_or(text: &str, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text.to_string()
    }
}

fn build_assistant_message(text: &str, calls: &[(String, String, serde_json::Value)]) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });
    }
    for (id, name, input) in calls {
        parts.push(ContentPart::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        });
    }
    Message {
        role: Role::Assistant,
        content: MessageContent::Parts(parts),
    }
}

/// Execute one tool call through the full C4 contract: beforeToolCall hooks
/// -> validate -> execute -> afterToolCall hooks. Every failure becomes a
/// tool-error value returned to the model; never propagates out of the loop.
#[allow(clippy::too_many_arguments)]
async fn dispatch_tool_call(
    call_id: &str,
    name: &str,
    input: serde_json::Value,
    tools: &ToolRegistry,
    hooks: &HookRegistry,
    cancel: &CancelToken,
    run_context: &RunContext,
    clarify: Arc<dyn ClarificationSink>,
) -> serde_json::Value {
    let outcome: Result<serde_json::Value> = async {
        let input = hooks.run_before_tool_call(name, input).await?;

        let Some(tool) = tools.get(name) else {
            return Err(Error::Tool {
                name: name.to_string(),
                message: "unknown tool".to_string(),
            });
        };

        if let Err(message) = validate_input(tool.input_schema(), &input) {
            return Err(Error::Tool {
                name: name.to_string(),
                message,
            });
        }

        let tool_ctx = ToolCtx::new(cancel.clone(), run_context.clone()).with_clarify(clarify);
        let output = tool.execute(input.clone(), &tool_ctx).await?;
        hooks.run_after_tool_call(name, &input, output).await
    }
    .await;

    match outcome {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(tool = name, call_id, error = %e, "tool call failed");
            serde_json::json!({ "error": e.to_string() })
        }
    }
}

enum ErrorAction {
    Retry,
    Return(String),
}

async fn handle_error(
    error: &Error,
    error_count: &mut u32,
    max_error_count: u32,
    cancel: &CancelToken,
) -> ErrorAction {
    if cancel.is_cancelled() {
        return ErrorAction::Return("Request aborted.".to_string());
    }

    *error_count += 1;
    if *error_count >= max_error_count {
        return ErrorAction::Return(format!("Failed after {error_count} errors: {error}"));
    }

    if is_retryable(error) {
        let delay_ms = (2000u64.saturating_mul(1u64 << (*error_count - 1))).min(30_000);
        if sleep_cancellable(Duration::from_millis(delay_ms), cancel).await {
            return ErrorAction::Return("Request aborted.".to_string());
        }
        return ErrorAction::Retry;
    }

    ErrorAction::Return(format!("Error: {error}"))
}

fn is_retryable(error: &Error) -> bool {
    let message = match error {
        Error::Provider { message, .. } => message.as_str(),
        Error::Http(message) => message.as_str(),
        Error::Timeout(_) => return true,
        _ => return false,
    };
    ["429", "500", "502", "503"]
        .iter()
        .any(|code| message.contains(code))
}

/// Sleep for `duration`, polling `cancel` so an abort during backoff returns
/// promptly. Returns `true` if cancellation was observed.
async fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> bool {
    const POLL: Duration = Duration::from_millis(50);
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return true;
        }
        let chunk = remaining.min(POLL);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
    cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_domain::capability::LlmCapabilities;
    use agentrt_domain::config::{CompactionConfig, LoopBoundsConfig};
    use agentrt_domain::stream::{BoxStream, FinishReason, Usage};
    use agentrt_providers::traits::{ChatResponse, EmbeddingsRequest, EmbeddingsResponse};
    use async_stream::stream;
    use std::sync::Mutex as StdMutex;

    struct NullSink;
    #[async_trait::async_trait]
    impl LoopSink for NullSink {}

    #[derive(Default)]
    struct RecordingSink {
        texts: StdMutex<Vec<String>>,
    }
    #[async_trait::async_trait]
    impl LoopSink for RecordingSink {
        async fn on_text(&self, delta: &str) {
            self.texts.lock().unwrap().push(delta.to_string());
        }
    }

    /// Scripted provider: returns one canned stream of events per call, in
    /// order, looping back to the last script on overrun.
    struct ScriptedProvider {
        scripts: StdMutex<Vec<Vec<Result<StreamEvent>>>>,
        capabilities: LlmCapabilities,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<Result<StreamEvent>>>) -> Self {
            Self {
                scripts: StdMutex::new(scripts),
                capabilities: LlmCapabilities::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            Ok(ChatResponse {
                content: "summary".to_string(),
                tool_calls: vec![],
                usage: None,
                model: "test".to_string(),
                finish_reason: Some("stop".to_string()),
            })
        }

        async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            let mut scripts = self.scripts.lock().unwrap();
            let next = if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                // `Error` isn't `Clone`, so re-derive the last script event-by-event
                // instead of cloning the whole `Vec<Result<StreamEvent>>`.
                scripts[0]
                    .iter()
                    .map(|r| match r {
                        Ok(e) => Ok(e.clone()),
                        Err(e) => Err(Error::Other(e.to_string())),
                    })
                    .collect::<Vec<_>>()
            };
            Ok(Box::pin(stream! {
                for event in next {
                    yield event;
                }
            }))
        }

        async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
            Ok(EmbeddingsResponse { embeddings: vec![] })
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn opts(provider: ScriptedProvider, sink: Arc<dyn LoopSink>) -> LoopOptions {
        LoopOptions {
            sink,
            cancel: CancelToken::new(),
            tools: Arc::new(ToolRegistry::new()),
            hooks: Arc::new(HookRegistry::new()),
            provider: Arc::new(provider),
            model: None,
            system_prompt: Some("be terse".to_string()),
            loop_bounds: LoopBoundsConfig::default(),
            compaction: CompactionConfig {
                compact_trigger: Some(1_000_000),
                ..CompactionConfig::default()
            },
            run_context: RunContext::default(),
        }
    }

    #[tokio::test]
    async fn plain_completion_returns_text_and_appends_assistant_message() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(StreamEvent::Token {
                text: "Hello!".to_string(),
            }),
            Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".to_string()),
            }),
        ]]);
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));

        let result = run_loop(&mut ctx, opts(provider, sink.clone())).await;

        assert_eq!(result, "Hello!");
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[1].content.extract_all_text(), "Hello!");
        assert_eq!(sink.texts.lock().unwrap().as_slice(), &["Hello!".to_string()]);
    }

    #[tokio::test]
    async fn stop_with_blank_text_is_bounded_by_max_steps() {
        // finish=stop with empty text re-enters the loop (spec Open Question
        // #1); with no tool calls ever offered, the only thing that can bound
        // it is the forced totalSteps increment against max_steps.
        let provider = ScriptedProvider::new(vec![vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".to_string()),
        })]]);
        let mut o = opts(provider, Arc::new(NullSink));
        o.loop_bounds.max_steps = 1;
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));

        let result = run_loop(&mut ctx, o).await;
        assert_eq!(result, "Max steps reached, task may be incomplete.");
    }

    #[tokio::test]
    async fn tool_calls_loop_is_bounded_by_max_steps() {
        // Neither provider adapter ever emits StepFinish, so the tool-calls
        // arm must bump totalSteps itself or a model stuck calling tools
        // forever would never hit the bound.
        let step = vec![
            Ok(StreamEvent::ToolCallFinished {
                call_id: "1".to_string(),
                tool_name: "noop".to_string(),
                arguments: serde_json::json!({}),
            }),
            Ok(StreamEvent::Done {
                usage: None,
                finish_reason: Some("tool-calls".to_string()),
            }),
        ];
        let provider = ScriptedProvider::new(vec![step]);
        let mut o = opts(provider, Arc::new(NullSink));
        o.loop_bounds.max_steps = 2;
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));

        let result = run_loop(&mut ctx, o).await;
        assert_eq!(result, "Max steps reached, task may be incomplete.");
    }

    #[tokio::test]
    async fn content_filter_without_text_returns_fallback() {
        let provider = ScriptedProvider::new(vec![vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("content-filter".to_string()),
        })]]);
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));
        let result = run_loop(&mut ctx, opts(provider, Arc::new(NullSink))).await;
        assert_eq!(result, "Content filtered.");
    }

    #[tokio::test]
    async fn cancelled_before_start_returns_aborted() {
        let provider = ScriptedProvider::new(vec![vec![Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".to_string()),
        })]]);
        let mut o = opts(provider, Arc::new(NullSink));
        o.cancel.cancel();
        let mut ctx = Context::new();
        ctx.push(Message::user("hi"));
        let result = run_loop(&mut ctx, o).await;
        assert_eq!(result, "Request aborted.");
    }

    #[test]
    fn is_retryable_detects_status_codes() {
        assert!(is_retryable(&Error::Provider {
            provider: "p".into(),
            message: "HTTP 429 rate limited".into()
        }));
        assert!(!is_retryable(&Error::Provider {
            provider: "p".into(),
            message: "HTTP 400 bad request".into()
        }));
    }

    #[test]
    fn finish_reason_as_str_roundtrips() {
        assert_eq!(FinishReason::ToolCalls.as_str(), "tool-calls");
    }

    #[tokio::test]
    async fn sleep_cancellable_returns_immediately_when_pre_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(sleep_cancellable(Duration::from_secs(5), &token).await);
    }
}

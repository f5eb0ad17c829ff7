//! The hook pipeline (C5): seven named points around LLM calls, tool calls,
//! and compaction, each an ordered, append-only list of handlers.

use crate::error::Result;
use crate::tool::{Message, ToolDefinition};
use async_trait::async_trait;
use serde_json::Value;

/// Mutable fields a `beforeRun`/`beforeLLMCall` handler may replace.
#[derive(Debug, Clone, Default)]
pub struct LlmCallOverride {
    pub system_prompt: Option<String>,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// One of the seven named hook points. Handlers of the same name always run
/// in registration order.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Invoked once before the loop is entered. May replace systemPrompt/tools.
    async fn before_run(&self, _messages: &[Message]) -> Result<LlmCallOverride> {
        Ok(LlmCallOverride::default())
    }

    /// Invoked once after the loop exits. Observational only.
    async fn after_run(&self, _result: &str) -> Result<()> {
        Ok(())
    }

    /// Invoked before each LLM stream. May replace systemPrompt/tools.
    async fn before_llm_call(&self, _messages: &[Message]) -> Result<LlmCallOverride> {
        Ok(LlmCallOverride::default())
    }

    /// Invoked after each LLM stream completes. Observational only.
    async fn after_llm_call(&self, _finish_reason: &str) -> Result<()> {
        Ok(())
    }

    /// Invoked before a tool executes. May return a replacement input.
    async fn before_tool_call(&self, _name: &str, input: Value) -> Result<Value> {
        Ok(input)
    }

    /// Invoked after a tool executes. May return a replacement output.
    async fn after_tool_call(&self, _name: &str, _input: &Value, output: Value) -> Result<Value> {
        Ok(output)
    }

    /// Invoked after the compactor yields new messages. Best-effort: a
    /// failure here must never abort the loop.
    async fn on_compacted(&self, _event: &crate::session::CompactionEvent) {}
}

/// The seven named hook points, each an ordered list of registered handlers.
/// Built once by the plugin manager at startup and shared immutably by every
/// run thereafter.
#[derive(Default, Clone)]
pub struct HookRegistry {
    handlers: Vec<std::sync::Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Hooks must not be added once a run is in flight;
    /// callers only invoke this during plugin initialization.
    pub fn register(&mut self, hook: std::sync::Arc<dyn Hook>) {
        self.handlers.push(hook);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn run_before_run(&self, messages: &[Message]) -> LlmCallOverride {
        self.fold_llm_override(|h| h.before_run(messages)).await
    }

    pub async fn run_before_llm_call(&self, messages: &[Message]) -> LlmCallOverride {
        self.fold_llm_override(|h| h.before_llm_call(messages)).await
    }

    async fn fold_llm_override<'a, F, Fut>(&'a self, f: F) -> LlmCallOverride
    where
        F: Fn(&'a std::sync::Arc<dyn Hook>) -> Fut,
        Fut: std::future::Future<Output = Result<LlmCallOverride>> + 'a,
    {
        let mut out = LlmCallOverride::default();
        for handler in &self.handlers {
            match f(handler).await {
                Ok(partial) => {
                    if partial.system_prompt.is_some() {
                        out.system_prompt = partial.system_prompt;
                    }
                    if partial.tools.is_some() {
                        out.tools = partial.tools;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "hook invocation failed"),
            }
        }
        out
    }

    pub async fn run_after_run(&self, result: &str) {
        for handler in &self.handlers {
            if let Err(e) = handler.after_run(result).await {
                tracing::warn!(error = %e, "afterRun hook failed");
            }
        }
    }

    pub async fn run_after_llm_call(&self, finish_reason: &str) {
        for handler in &self.handlers {
            if let Err(e) = handler.after_llm_call(finish_reason).await {
                tracing::warn!(error = %e, "afterLLMCall hook failed");
            }
        }
    }

    /// Run the beforeToolCall chain, threading the (possibly replaced)
    /// input through each handler in registration order.
    pub async fn run_before_tool_call(&self, name: &str, mut input: Value) -> Result<Value> {
        for handler in &self.handlers {
            input = handler.before_tool_call(name, input).await?;
        }
        Ok(input)
    }

    /// Run the afterToolCall chain, threading the (possibly replaced)
    /// output through each handler in registration order.
    pub async fn run_after_tool_call(
        &self,
        name: &str,
        input: &Value,
        mut output: Value,
    ) -> Result<Value> {
        for handler in &self.handlers {
            output = handler.after_tool_call(name, input, output).await?;
        }
        Ok(output)
    }

    pub async fn run_on_compacted(&self, event: &crate::session::CompactionEvent) {
        for handler in &self.handlers {
            handler.on_compacted(event).await;
        }
    }
}

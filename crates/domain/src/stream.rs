use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted during LLM streaming (provider-agnostic).
///
/// The agent loop drains these and forwards them to the caller-supplied
/// callbacks (onText, onToolCall, onToolResult, onStepFinish).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk ("text-delta").
    #[serde(rename = "token")]
    Token { text: String },

    /// A reasoning/thinking token chunk, distinct from final-answer text.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments ("tool-call" chunk event).
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// A tool result became available ("tool-result" chunk event).
    #[serde(rename = "tool_result")]
    ToolResult {
        call_id: String,
        tool_name: String,
        output: serde_json::Value,
    },

    /// One generation step finished ("step-finish" chunk event).
    #[serde(rename = "step_finish")]
    StepFinish { step: Step },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

/// A single model generation step, recorded as the stream progresses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Step {
    pub text: String,
    pub tool_call_ids: Vec<String>,
}

/// Token usage for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// The reason a streamed generation terminated. Exactly one is produced
/// per `stream()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model returned final text with no further tool calls pending.
    Stop,
    /// The model requested one or more tools and halted mid-turn.
    ToolCalls,
    /// The context window was exhausted.
    Length,
    /// The provider's content filter rejected the generation.
    ContentFilter,
    /// The provider call failed.
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool-calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content-filter",
            FinishReason::Error => "error",
        }
    }
}

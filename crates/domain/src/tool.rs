use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Internal tool call format (provider-agnostic).
/// Every adapter converts provider-specific tool calls to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    /// Model "thinking" content, kept separate from the final answer text.
    #[serde(rename = "reasoning")]
    Reasoning { text: String },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: false,
            }]),
        }
    }

    /// An assistant message carrying a single tool-call part (used by the
    /// loop to append the model's tool invocation to the Context before the
    /// matching tool-result is appended).
    pub fn assistant_tool_call(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: id.into(),
                name: name.into(),
                input,
            }]),
        }
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Extract and join all text content, returning an owned String.
    ///
    /// For `Text` variant, returns the string directly.
    /// For `Parts` variant, joins all `Text` parts with `"\n"`.
    /// Non-text parts (ToolUse, ToolResult, Image) are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait (C4) and its execution context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request for the user to resolve an ambiguity mid-run (C13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub default_answer: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Routes a clarification request to the platform's stream sink and
/// resolves once the user (or the timeout/default) answers. Implemented by
/// the dispatcher; tools never talk to a platform adapter directly.
#[async_trait::async_trait]
pub trait ClarificationSink: Send + Sync {
    async fn ask(&self, request: ClarificationRequest) -> crate::error::Result<String>;
}

/// Opaque, per-run bag of identifying context a tool may read but not
/// interpret (platformKey, sessionId, the triggering user text).
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub platform_key: String,
    pub session_id: String,
    pub user_text: String,
}

/// Everything a tool's `execute` needs beyond its validated input.
pub struct ToolCtx {
    pub cancel: CancelToken,
    pub clarify: Option<Arc<dyn ClarificationSink>>,
    pub run: RunContext,
}

impl ToolCtx {
    pub fn new(cancel: CancelToken, run: RunContext) -> Self {
        Self {
            cancel,
            clarify: None,
            run,
        }
    }

    pub fn with_clarify(mut self, sink: Arc<dyn ClarificationSink>) -> Self {
        self.clarify = Some(sink);
        self
    }
}

/// A named, schema-described capability the model may invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema describing the shape of valid input.
    fn input_schema(&self) -> &serde_json::Value;
    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolCtx,
    ) -> crate::error::Result<serde_json::Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema().clone(),
        }
    }
}

/// Minimal structural validation: `type: object` requires an object value;
/// every name in `required` must be present. Not a full JSON-Schema engine —
/// sufficient to reject the "tool input invalid" error class before
/// `execute` runs.
pub fn validate_input(schema: &serde_json::Value, input: &serde_json::Value) -> Result<(), String> {
    let Some(obj_type) = schema.get("type").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    if obj_type == "object" {
        let Some(map) = input.as_object() else {
            return Err("expected an object".to_string());
        };
        if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
            for name in required {
                let Some(name) = name.as_str() else { continue };
                if !map.contains_key(name) {
                    return Err(format!("missing required field: {name}"));
                }
            }
        }
    }
    Ok(())
}

/// Name → Tool mapping (C4). Built by the plugin manager at startup, then
/// read-only for the lifetime of the process.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces an existing entry of the same name
    /// (the plugin manager is responsible for enforcing the no-collision
    /// invariant unless a replacement policy flag allows it).
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn register_many(&mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names, for stable listing output.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut names = self.tool_names();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| self.tools.get(&n).map(|t| t.definition()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_from_parts_joins_with_newline() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "line one".into() },
            ContentPart::ToolUse {
                id: "c1".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn extract_all_text_empty_parts() {
        let content = MessageContent::Parts(vec![]);
        assert_eq!(content.extract_all_text(), "");
    }

    #[test]
    fn validate_input_rejects_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["path"],
        });
        let err = validate_input(&schema, &serde_json::json!({})).unwrap_err();
        assert!(err.contains("path"));
    }

    #[test]
    fn validate_input_accepts_present_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["path"],
        });
        assert!(validate_input(&schema, &serde_json::json!({"path": "/tmp"})).is_ok());
    }

    #[test]
    fn validate_input_rejects_non_object_when_object_expected() {
        let schema = serde_json::json!({"type": "object"});
        assert!(validate_input(&schema, &serde_json::json!("nope")).is_err());
    }

    #[test]
    fn validate_input_no_type_constraint_always_ok() {
        let schema = serde_json::json!({});
        assert!(validate_input(&schema, &serde_json::json!(42)).is_ok());
    }
}

//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint that follows the OpenAI chat completions contract.

use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::{from_reqwest, resolve_api_key};
use agentrt_domain::capability::LlmCapabilities;
use agentrt_domain::config::ProviderConfig;
use agentrt_domain::error::{Error, Result};
use agentrt_domain::stream::{BoxStream, StreamEvent, Usage};
use agentrt_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-compatible API endpoint.
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new provider from the deserialized provider config.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into());

        let capabilities = LlmCapabilities {
            supports_tools: agentrt_domain::capability::ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: true,
            context_window_tokens: cfg.context_window_tokens.map(|v| v as usize).or(Some(128_000)),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            capabilities,
            client,
        })
    }

    // ── Internal: build authenticated request builder ──────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    /// Resolve the effective model name for this request.
    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => {
            let text = msg.content.extract_all_text();
            serde_json::json!({
                "role": role_to_str(msg.role),
                "content": text,
            })
        }
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => {
            text_parts.push(t.clone());
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            }
                        }));
                    }
                    _ => {}
                }
            }
        }
    }

    if text_parts.is_empty() {
        obj["content"] = Value::Null;
    } else {
        obj["content"] = Value::String(text_parts.join("\n"));
    }
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Parts(parts) => {
            for part in parts {
                if let ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } = part
                {
                    return serde_json::json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    });
                }
            }
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": ""})
        }
        MessageContent::Text(t) => serde_json::json!({
            "role": "tool",
            "tool_call_id": "",
            "content": t,
        }),
    }
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: "openai_compat".into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: "openai_compat".into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(normalize_finish_reason);

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        content,
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall {
                call_id,
                tool_name,
                arguments,
            })
        })
        .collect()
}

/// Map provider-raw finish reasons to the canonical kebab-case set the agent
/// loop matches on (`tool_calls` -> `tool-calls`, `content_filter` ->
/// `content-filter`); everything else passes through unchanged (`stop`,
/// `length`).
fn normalize_finish_reason(s: &str) -> String {
    match s {
        "tool_calls" => "tool-calls".to_string(),
        "content_filter" => "content-filter".to_string(),
        other => other.to_string(),
    }
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Internal state for assembling tool calls from streaming deltas. OpenAI
/// splits a tool call's id/name and its argument JSON across many chunks,
/// keyed by array index, so accumulation has to span calls to the parser.
struct StreamState {
    /// index -> (call_id, tool_name, args_buffer)
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: std::collections::HashMap::new(),
        }
    }

    fn finish_tool_calls(&mut self) -> Vec<Result<StreamEvent>> {
        self.active_tool_calls
            .drain()
            .map(|(_, (call_id, tool_name, args_str))| {
                let arguments: Value =
                    serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                })
            })
            .collect()
    }
}

fn parse_sse_data(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let choice = v
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first());

    // Usage-only chunk (stream_options.include_usage).
    let choice = match choice {
        Some(c) => c,
        None => {
            if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
                events.push(Ok(StreamEvent::Done {
                    usage: Some(usage),
                    finish_reason: None,
                }));
            }
            return events;
        }
    };

    let delta = choice.get("delta").unwrap_or(&Value::Null);

    // Tool call deltas: accumulate per index, surface a started/delta event
    // as each chunk arrives.
    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);

            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                match state.active_tool_calls.get_mut(&idx) {
                    // Some compat backends resend id/name alongside later
                    // argument deltas; keep whatever has already accumulated.
                    Some(entry) => {
                        entry.0 = id.to_string();
                        if !name.is_empty() {
                            entry.1 = name;
                        }
                    }
                    None => {
                        state
                            .active_tool_calls
                            .insert(idx, (id.to_string(), name.clone(), String::new()));
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: id.to_string(),
                            tool_name: name,
                        }));
                    }
                }
            }

            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                if let Some(entry) = state.active_tool_calls.get_mut(&idx) {
                    entry.2.push_str(args);
                    events.push(Ok(StreamEvent::ToolCallDelta {
                        call_id: entry.0.clone(),
                        delta: args.to_string(),
                    }));
                }
            }
        }
    }

    // Finish reason: close out any tool calls assembled so far, then emit Done.
    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        events.extend(state.finish_tool_calls());
        let usage = v.get("usage").and_then(parse_openai_usage);
        events.push(Ok(StreamEvent::Done {
            usage,
            finish_reason: Some(normalize_finish_reason(fr)),
        }));
        return events;
    }

    // Reasoning content (DeepSeek, etc.)
    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Thinking {
                text: text.to_string(),
            }));
        }
    }

    // Text content delta.
    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token {
                text: text.to_string(),
            }));
        }
    }

    events
}

/// Parse a single SSE data line, handling the `[DONE]` sentinel. Any tool
/// calls still assembling when `[DONE]` arrives are closed out first.
fn parse_sse_data_vec(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        let mut events = state.finish_tool_calls();
        events.push(Ok(StreamEvent::Done {
            usage: None,
            finish_reason: Some("stop".into()),
        }));
        return events;
    }

    parse_sse_data(data, state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: provider_id,
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_data_vec(data, &mut state)
        }))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "text-embedding-3-small".into());
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({ "model": model, "input": req.input });

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let data = resp_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Provider {
                provider: self.id.clone(),
                message: "missing 'data' array in embeddings response".into(),
            })?;

        let embeddings: Vec<Vec<f32>> = data
            .iter()
            .filter_map(|item| {
                let embedding = item.get("embedding")?.as_array()?;
                Some(
                    embedding
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect(),
                )
            })
            .collect();

        Ok(EmbeddingsResponse { embeddings })
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

//! `agentrt run` — one-shot execution command.
//!
//! Sends a single message to the agent, streams the response to stdout, and
//! exits. Useful for scripting, piping, and quick CLI interactions.

use std::io::Write;
use std::sync::Arc;

use agentrt_domain::config::Config;
use agentrt_domain::error::Result;
use agentrt_domain::tool::ClarificationRequest;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bootstrap;
use crate::platform::{AckResponse, IncomingMessage, PlatformAdapter, StreamHandle};
use crate::runtime::clarify::ClarificationHub;
use crate::runtime::dispatch::dispatch;

/// Captures what the loop produced so `run` can decide how to print it and
/// what exit code to use, since `dispatch` only reports through the stream
/// handle rather than returning a value.
struct OneShotHandle {
    json_output: bool,
    clarifications: Arc<ClarificationHub>,
    stream_id: String,
    texts: Mutex<Vec<String>>,
    tool_calls: Mutex<Vec<(String, serde_json::Value)>>,
    result: Mutex<Option<String>>,
    error: Mutex<Option<String>>,
}

#[async_trait]
impl StreamHandle for OneShotHandle {
    async fn on_text(&self, delta: &str) {
        if self.json_output {
            self.texts.lock().push(delta.to_string());
        } else {
            print!("{delta}");
            std::io::stdout().flush().ok();
        }
    }

    async fn on_tool_call(&self, name: &str, input: &serde_json::Value) {
        if self.json_output {
            self.tool_calls.lock().push((name.to_string(), input.clone()));
        } else {
            eprintln!("\x1B[2m[tool: {name}]\x1B[0m");
        }
    }

    async fn on_clarification(&self, request: &ClarificationRequest) {
        let prompt = request.prompt.clone();
        let answer = tokio::task::spawn_blocking(move || {
            eprintln!("\x1B[33m{prompt}\x1B[0m");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok();
            line.trim().to_string()
        })
        .await
        .unwrap_or_default();
        self.clarifications.answer(&self.stream_id, answer);
    }

    async fn on_done(&self, result: &str) {
        *self.result.lock() = Some(result.to_string());
    }

    async fn on_error(&self, message: &str) {
        *self.error.lock() = Some(message.to_string());
    }
}

/// Hands `dispatch` a fixed platform key and a single message, then hangs
/// onto the `OneShotHandle` it created so `run` can read the outcome back
/// once `dispatch` returns.
struct OneShotAdapter {
    clarifications: Arc<ClarificationHub>,
    json_output: bool,
    handle: Mutex<Option<Arc<OneShotHandle>>>,
}

#[async_trait]
impl PlatformAdapter for OneShotAdapter {
    async fn verify_request(&self, _raw: &serde_json::Value) -> bool {
        true
    }

    async fn parse_incoming(&self, raw: &serde_json::Value) -> Result<Option<IncomingMessage>> {
        Ok(Some(IncomingMessage {
            platform_key: raw["platformKey"].as_str().unwrap_or_default().to_string(),
            memory_key: None,
            text: raw["text"].as_str().unwrap_or_default().to_string(),
            force_new_session: false,
            stream_id: None,
        }))
    }

    async fn ack_request(&self, incoming: &IncomingMessage) -> AckResponse {
        AckResponse {
            stream_id: incoming.stream_id.clone().unwrap_or_default(),
        }
    }

    async fn create_stream_handle(
        &self,
        _incoming: &IncomingMessage,
        stream_id: &str,
    ) -> Arc<dyn StreamHandle> {
        let handle = Arc::new(OneShotHandle {
            json_output: self.json_output,
            clarifications: self.clarifications.clone(),
            stream_id: stream_id.to_string(),
            texts: Mutex::new(Vec::new()),
            tool_calls: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            error: Mutex::new(None),
        });
        *self.handle.lock() = Some(handle.clone());
        handle
    }
}

/// Execute a single agent turn and print the response. Entry point for
/// `agentrt run "message"`.
pub async fn run(
    config: Config,
    message: String,
    session_key: String,
    model: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let config_dir = std::env::current_dir()?;
    let state = bootstrap::build_app_state(config, &config_dir).await?;
    let (provider, default_model) = bootstrap::resolve_default_model(&state)?;
    let mut deps = state.dispatcher_deps(provider, default_model);
    if model.is_some() {
        deps.model = model;
    }
    let deps = Arc::new(deps);

    let adapter = Arc::new(OneShotAdapter {
        clarifications: state.clarifications.clone(),
        json_output,
        handle: Mutex::new(None),
    });

    let raw = serde_json::json!({"platformKey": session_key, "text": message});
    dispatch(adapter.as_ref(), &raw, &deps).await?;

    let handle = adapter.handle.lock().clone().expect("dispatch always creates a stream handle");

    let mut exit_code = 0;
    if let Some(message) = handle.error.lock().clone() {
        exit_code = 1;
        if !json_output {
            eprintln!("error: {message}");
        }
    }

    if json_output {
        let payload = serde_json::json!({
            "text": handle.texts.lock().join(""),
            "toolCalls": handle.tool_calls.lock().iter().map(|(name, input)| {
                serde_json::json!({"name": name, "input": input})
            }).collect::<Vec<_>>(),
            "result": handle.result.lock().clone(),
            "error": handle.error.lock().clone(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!();
    }

    if let Err(e) = state.sessions.flush() {
        tracing::warn!(error = %e, "session store flush on exit failed");
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}

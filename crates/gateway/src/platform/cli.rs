//! CLI platform adapter — a single-user stdin/stdout REPL. `verify_request`
//! is a no-op (there is no untrusted network boundary); `parse_incoming`
//! treats every non-empty line as one message for a fixed `platformKey`.

use std::sync::Arc;

use agentrt_domain::error::Result;
use agentrt_domain::tool::ClarificationRequest;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::runtime::clarify::ClarificationHub;
use crate::runtime::dispatch::{dispatch, DispatcherDeps};

use super::{AckResponse, IncomingMessage, PlatformAdapter, StreamHandle};

/// The one `platformKey` a CLI session ever uses; there is no multi-tenant
/// concept on this transport.
pub const CLI_PLATFORM_KEY: &str = "cli:local";

pub struct CliAdapter {
    clarifications: Arc<ClarificationHub>,
    editor: Arc<Mutex<DefaultEditor>>,
}

impl CliAdapter {
    pub fn new(clarifications: Arc<ClarificationHub>, editor: Arc<Mutex<DefaultEditor>>) -> Self {
        Self {
            clarifications,
            editor,
        }
    }
}

#[async_trait]
impl PlatformAdapter for CliAdapter {
    async fn verify_request(&self, _raw: &serde_json::Value) -> bool {
        true
    }

    async fn parse_incoming(&self, raw: &serde_json::Value) -> Result<Option<IncomingMessage>> {
        let text = raw["text"].as_str().unwrap_or_default().to_string();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(IncomingMessage {
            platform_key: CLI_PLATFORM_KEY.to_string(),
            memory_key: None,
            text,
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
        Arc::new(StdoutHandle {
            stream_id: stream_id.to_string(),
            clarifications: self.clarifications.clone(),
            editor: self.editor.clone(),
        })
    }
}

struct StdoutHandle {
    stream_id: String,
    clarifications: Arc<ClarificationHub>,
    editor: Arc<Mutex<DefaultEditor>>,
}

#[async_trait]
impl StreamHandle for StdoutHandle {
    async fn on_text(&self, delta: &str) {
        use std::io::Write;
        print!("{delta}");
        std::io::stdout().flush().ok();
    }

    async fn on_tool_call(&self, name: &str, _input: &serde_json::Value) {
        eprintln!("\x1B[2m[tool: {name}]\x1B[0m");
    }

    async fn on_clarification(&self, request: &ClarificationRequest) {
        let prompt = request.prompt.clone();
        let editor = self.editor.clone();
        let answer = tokio::task::spawn_blocking(move || {
            eprintln!("\x1B[33m{prompt}\x1B[0m");
            editor.lock().readline("> ").unwrap_or_default()
        })
        .await
        .unwrap_or_default();
        self.clarifications.answer(&self.stream_id, answer);
    }

    async fn on_done(&self, result: &str) {
        println!("{result}");
        println!();
    }

    async fn on_error(&self, message: &str) {
        eprintln!("\x1B[31merror: {message}\x1B[0m");
    }
}

/// Drive the REPL to completion: `exit` quits, a blank line re-prompts, and
/// Ctrl+C cancels an in-flight run without closing the REPL; a second Ctrl+C
/// while that cancellation is still unwinding (or any Ctrl+C with no run in
/// flight) exits.
pub async fn run_repl(
    adapter: Arc<CliAdapter>,
    deps: Arc<DispatcherDeps>,
    history_path: std::path::PathBuf,
    editor: Arc<Mutex<DefaultEditor>>,
) -> anyhow::Result<()> {
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    editor.lock().load_history(&history_path).ok();

    eprintln!("Type 'exit' or Ctrl+D to quit.");
    eprintln!();

    loop {
        let ed = editor.clone();
        let readline =
            tokio::task::spawn_blocking(move || ed.lock().readline("you> ")).await?;

        match readline {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                editor.lock().add_history_entry(&line).ok();

                if trimmed == "exit" {
                    break;
                }

                let raw = serde_json::json!({"text": trimmed});
                match run_turn_with_interrupt(&adapter, &deps, raw).await {
                    Ok(()) => {}
                    Err(e) => {
                        eprintln!("\x1B[31merror: {e}\x1B[0m");
                        if e.to_string() == FORCED_EXIT_SENTINEL {
                            break;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                if deps.active_runs.has_active_run(CLI_PLATFORM_KEY) {
                    deps.active_runs.abort_active_run(CLI_PLATFORM_KEY);
                    eprintln!("(cancelled)");
                    continue;
                }
                break;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("\x1B[31mreadline error: {e}\x1B[0m");
                break;
            }
        }
    }

    editor.lock().save_history(&history_path).ok();
    if let Err(e) = deps.sessions.flush() {
        eprintln!("\x1B[31mfailed to flush sessions: {e}\x1B[0m");
    }
    eprintln!("Goodbye!");
    Ok(())
}

const FORCED_EXIT_SENTINEL: &str = "interrupted twice, aborting REPL";

/// Run one dispatch concurrently with Ctrl+C detection so a cancellation
/// during the loop reaches the active run's `CancelToken` instead of killing
/// the whole process.
async fn run_turn_with_interrupt(
    adapter: &Arc<CliAdapter>,
    deps: &Arc<DispatcherDeps>,
    raw: serde_json::Value,
) -> anyhow::Result<()> {
    let adapter = adapter.clone();
    let deps_task = deps.clone();
    let mut task = tokio::spawn(async move { dispatch(adapter.as_ref(), &raw, &deps_task).await });

    tokio::select! {
        result = &mut task => {
            return result.map_err(anyhow::Error::from)?.map_err(anyhow::Error::from);
        }
        _ = tokio::signal::ctrl_c() => {
            deps.active_runs.abort_active_run(CLI_PLATFORM_KEY);
        }
    }

    tokio::select! {
        result = &mut task => {
            result.map_err(anyhow::Error::from)?.map_err(anyhow::Error::from)
        }
        _ = tokio::signal::ctrl_c() => {
            task.abort();
            Err(anyhow::anyhow!(FORCED_EXIT_SENTINEL))
        }
    }
}

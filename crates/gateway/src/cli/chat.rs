//! `agentrt chat` — interactive REPL command.
//!
//! Boots the full runtime, then hands off to `platform::cli::run_repl`,
//! which owns the readline loop, slash-less plain-text turns, and Ctrl+C
//! cancellation semantics.

use std::sync::Arc;

use agentrt_domain::config::Config;
use parking_lot::Mutex;
use rustyline::DefaultEditor;

use crate::bootstrap;
use crate::platform::cli::{run_repl, CliAdapter};

/// Run the interactive chat REPL. Boots the full runtime (including
/// background tasks for session flushing) then enters the readline loop.
pub async fn chat(config: Config, model: Option<String>) -> anyhow::Result<()> {
    let config_dir = std::env::current_dir()?;
    let state = bootstrap::build_app_state(config, &config_dir).await?;
    bootstrap::spawn_background_tasks(&state);

    let (provider, default_model) = bootstrap::resolve_default_model(&state)?;
    let mut deps = state.dispatcher_deps(provider, default_model);
    if model.is_some() {
        deps.model = model;
    }
    let deps = Arc::new(deps);

    let editor = Arc::new(Mutex::new(DefaultEditor::new()?));
    let adapter = Arc::new(CliAdapter::new(state.clarifications.clone(), editor.clone()));

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".agentrt")
        .join("chat_history.txt");

    run_repl(adapter, deps, history_path, editor).await
}

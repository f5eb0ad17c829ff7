//! Shared application state handed to every transport. Everything here is
//! computed once at startup (see `bootstrap.rs`) and is cheap to clone
//! (`Arc` all the way down), so handlers and the CLI REPL driver both hold
//! their own `Arc<AppState>` without contention.

use std::sync::Arc;

use agentrt_domain::config::Config;
use agentrt_providers::registry::ProviderRegistry;
use agentrt_sessions::{IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};

use crate::platform::http::StreamRegistry;
use crate::runtime::active_run::ActiveRunRegistry;
use crate::runtime::clarify::ClarificationHub;
use crate::runtime::dispatch::DispatcherDeps;
use crate::runtime::plugins::PluginManager;

/// Shared application state passed to all API handlers and the CLI driver.
#[derive(Clone)]
pub struct AppState {
    // ── Core services ───────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,
    pub plugins: Arc<PluginManager>,

    // ── Session management ──────────────────────────────────────────
    pub sessions: Arc<SessionStore>,
    pub identity: Arc<IdentityResolver>,
    pub lifecycle: Arc<LifecycleManager>,
    pub transcripts: Arc<TranscriptWriter>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub active_runs: Arc<ActiveRunRegistry>,
    pub clarifications: Arc<ClarificationHub>,

    // ── HTTP transport ────────────────────────────────────────────────
    /// Buffered SSE event registry; only used by `api::chat`/`api::stream`,
    /// kept here so both the router builder and the background sweep can
    /// reach it.
    pub stream_registry: Arc<StreamRegistry>,

    // ── Security (startup-computed) ────────────────────────────────────
    /// Bearer token for `/api/*` routes. `None` = dev mode (no auth enforced).
    pub api_secret: Option<String>,
    /// Bearer token for the internal loopback `/agent/run` route.
    pub internal_secret: Option<String>,
}

impl AppState {
    /// Build the `DispatcherDeps` a run needs, pinning the default provider
    /// and model resolved at startup (`bootstrap::resolve_default_model`).
    pub fn dispatcher_deps(&self, provider: Arc<dyn agentrt_providers::LlmProvider>, model: Option<String>) -> DispatcherDeps {
        DispatcherDeps {
            sessions: self.sessions.clone(),
            transcripts: self.transcripts.clone(),
            active_runs: self.active_runs.clone(),
            clarifications: self.clarifications.clone(),
            tools: self.plugins.tools(),
            hooks: self.plugins.hooks(),
            provider,
            model,
            system_prompt: None,
            loop_bounds: self.config.loop_bounds.clone(),
            compaction: self.config.compaction.clone(),
            skills: None,
        }
    }
}


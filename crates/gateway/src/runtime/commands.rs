//! Command router (C11) — parses `/`-prefixed text before it reaches the
//! agent loop: session management, status, and skill-invocation shorthand.

use std::sync::Arc;

use agentrt_domain::config::CompactionConfig;
use agentrt_domain::session::CompactionTrigger;
use agentrt_domain::skill::{SkillLookupError, SkillRegistry};
use agentrt_providers::LlmProvider;
use agentrt_sessions::store::SessionStore;
use chrono::Utc;

use crate::runtime::active_run::ActiveRunRegistry;
use crate::runtime::compact::{compact, CompactionOutcome};

pub enum RouterOutcome {
    /// Not a command; pass the original text through unchanged.
    None,
    /// A command was fully handled; send `message` back to the user.
    Handled(String),
    /// A command was handled with nothing to say (reserved for future use).
    HandledSilent,
    /// The text was rewritten; continue dispatch with the new text.
    Transformed(String),
}

/// Commands exempt from the busy gate even while a run is active.
const BUSY_WHITELIST: &[&str] = &["/help", "/start", "/status", "/stop"];

pub struct CommandContext<'a> {
    pub platform_key: &'a str,
    pub sessions: &'a SessionStore,
    pub active_runs: &'a ActiveRunRegistry,
    pub skills: Option<Arc<dyn SkillRegistry>>,
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub compaction: &'a CompactionConfig,
}

pub async fn route(text: &str, ctx: &CommandContext<'_>) -> RouterOutcome {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return RouterOutcome::None;
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    if ctx.active_runs.has_active_run(ctx.platform_key) && !BUSY_WHITELIST.contains(&command.as_str())
    {
        return RouterOutcome::Handled(busy_message());
    }

    match command.as_str() {
        "/help" | "/start" => RouterOutcome::Handled(help_message()),
        "/new" => {
            ctx.sessions.create_new_session(ctx.platform_key);
            RouterOutcome::Handled("Started a new session.".to_string())
        }
        "/clear" => {
            ctx.sessions.clear_current(ctx.platform_key);
            RouterOutcome::Handled("Session cleared.".to_string())
        }
        "/resume" | "/sessions" => resume_or_list(rest, ctx),
        "/status" => status_message(ctx),
        "/stop" => stop_message(ctx),
        "/skills" => skills_command(rest, ctx),
        "/compact" => compact_command(ctx).await,
        _ => RouterOutcome::Handled(help_message()),
    }
}

fn help_message() -> String {
    "Commands: /help /new /clear /resume [id] /sessions /status /stop /skills [name|index] \
     /compact"
        .to_string()
}

fn busy_message() -> String {
    "A run is already in progress. Use /stop to cancel it, or /status to check on it.".to_string()
}

fn resume_or_list(arg: &str, ctx: &CommandContext<'_>) -> RouterOutcome {
    if arg.is_empty() {
        let current = ctx.sessions.get_current_session_id(ctx.platform_key);
        let sessions = ctx.sessions.list_sessions(ctx.platform_key, 10);
        if sessions.is_empty() {
            return RouterOutcome::Handled("No sessions yet.".to_string());
        }
        let mut lines = Vec::with_capacity(sessions.len());
        for s in sessions {
            let marker = if Some(&s.id) == current.as_ref() { "✅ " } else { "" };
            lines.push(format!(
                "{marker}{} — {} ({} msgs)",
                s.id, s.preview, s.message_count
            ));
        }
        RouterOutcome::Handled(lines.join("\n"))
    } else {
        // Open Question #3: `/resume` for a session that belongs to a
        // different platformKey must never promote it; SessionStore::attach
        // already enforces this and returns a typed failure reason.
        let outcome = ctx.sessions.attach(ctx.platform_key, arg);
        if outcome.ok {
            RouterOutcome::Handled(format!("Resumed session {arg}."))
        } else {
            RouterOutcome::Handled(format!(
                "Could not resume session {arg}: {}",
                outcome.reason.unwrap_or_default()
            ))
        }
    }
}

fn status_message(ctx: &CommandContext<'_>) -> RouterOutcome {
    let mut lines = Vec::new();
    match ctx.active_runs.get_active_run(ctx.platform_key) {
        Some(run) => {
            let elapsed_ms = (Utc::now() - run.started_at).num_milliseconds().max(0);
            lines.push(format!("Run active for {elapsed_ms}ms (stream {}).", run.stream_id));
        }
        None => lines.push("No run is currently active.".to_string()),
    }
    match ctx.sessions.get_current_status(ctx.platform_key) {
        Some(status) => lines.push(format!(
            "Session {} — {} messages, last updated {}.",
            status.session_id, status.message_count, status.updated_at
        )),
        None => lines.push("No current session.".to_string()),
    }
    RouterOutcome::Handled(lines.join("\n"))
}

fn stop_message(ctx: &CommandContext<'_>) -> RouterOutcome {
    let outcome = ctx.active_runs.abort_active_run(ctx.platform_key);
    if outcome.aborted {
        RouterOutcome::Handled("Stopping the active run.".to_string())
    } else {
        RouterOutcome::Handled("No run is currently active.".to_string())
    }
}

fn skills_command(arg: &str, ctx: &CommandContext<'_>) -> RouterOutcome {
    let Some(skills) = &ctx.skills else {
        return RouterOutcome::Handled("No skills are registered.".to_string());
    };

    if arg.is_empty() || arg.eq_ignore_ascii_case("list") {
        let entries = skills.list();
        if entries.is_empty() {
            return RouterOutcome::Handled("No skills are registered.".to_string());
        }
        let lines: Vec<String> = entries
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {} — {}", i + 1, s.name, s.description))
            .collect();
        return RouterOutcome::Handled(lines.join("\n"));
    }

    let mut parts = arg.splitn(2, char::is_whitespace);
    let selector = parts.next().unwrap_or("");
    let message = parts.next().unwrap_or("").trim();

    match skills.resolve(selector) {
        Ok(name) => RouterOutcome::Transformed(format!("[use skill]({name}) {message}")),
        Err(SkillLookupError::NotFound) => {
            RouterOutcome::Handled(format!("No skill matches '{selector}'."))
        }
        Err(SkillLookupError::Ambiguous(names)) => RouterOutcome::Handled(format!(
            "'{selector}' matches more than one skill: {}",
            names.join(", ")
        )),
    }
}

async fn compact_command(ctx: &CommandContext<'_>) -> RouterOutcome {
    let Some(provider) = &ctx.provider else {
        return RouterOutcome::Handled("No model provider configured.".to_string());
    };
    let Some(session) = ctx.sessions.get_current(ctx.platform_key) else {
        return RouterOutcome::Handled("No current session.".to_string());
    };

    let outcome = compact(
        &session.context,
        true,
        CompactionTrigger::PreLoop,
        1,
        provider.as_ref(),
        ctx.compaction,
    )
    .await;

    match outcome {
        CompactionOutcome::Compacted { messages, event } => {
            let mut next = session.context.clone();
            next.messages = messages;
            if let Err(e) = ctx.sessions.save(&session.session_id, next) {
                return RouterOutcome::Handled(format!("Compaction ran but failed to save: {e}"));
            }
            RouterOutcome::Handled(format!(
                "Compacted {} -> {} messages ({:?} strategy, {} -> {} estimated tokens).",
                event.before_message_count,
                event.after_message_count,
                event.strategy,
                event.before_estimated_tokens,
                event.after_estimated_tokens
            ))
        }
        CompactionOutcome::DidNotCompact => {
            RouterOutcome::Handled("no compaction triggered".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_domain::session::ActiveRun;
    use agentrt_domain::skill::SkillSummary;
    use agentrt_domain::tool::Message;

    struct Fixture {
        sessions: SessionStore,
        active_runs: ActiveRunRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                sessions: SessionStore::new(dir.path()).unwrap(),
                active_runs: ActiveRunRegistry::new(),
            }
        }

        fn ctx<'a>(&'a self) -> CommandContext<'a> {
            CommandContext {
                platform_key: "web:u1",
                sessions: &self.sessions,
                active_runs: &self.active_runs,
                skills: None,
                provider: None,
                compaction: compaction_config(),
            }
        }
    }

    static STATIC_COMPACTION: std::sync::OnceLock<CompactionConfig> = std::sync::OnceLock::new();

    fn compaction_config() -> &'static CompactionConfig {
        STATIC_COMPACTION.get_or_init(CompactionConfig::default)
    }

    #[tokio::test]
    async fn non_slash_text_passes_through() {
        let fixture = Fixture::new();
        let outcome = route("hello", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::None));
    }

    #[tokio::test]
    async fn unknown_command_shows_help() {
        let fixture = Fixture::new();
        let outcome = route("/bogus", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("Commands:")));
    }

    #[tokio::test]
    async fn busy_gate_blocks_non_whitelisted_commands() {
        let fixture = Fixture::new();
        fixture
            .active_runs
            .set_active_run(ActiveRun::new("s1", "web:u1"));
        let outcome = route("/new", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("already in progress")));
    }

    #[tokio::test]
    async fn busy_gate_allows_whitelisted_status() {
        let fixture = Fixture::new();
        fixture
            .active_runs
            .set_active_run(ActiveRun::new("s1", "web:u1"));
        let outcome = route("/status", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(_)));
    }

    #[tokio::test]
    async fn resume_never_promotes_a_foreign_session() {
        let fixture = Fixture::new();
        // A session that belongs to a different platformKey.
        let other = SessionStore::new(tempfile::tempdir().unwrap().path()).unwrap();
        let foreign_id = other.create_new_session("web:someone-else");

        let before = fixture.sessions.get_current_session_id("web:u1");
        let outcome = route(&format!("/resume {foreign_id}"), &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("Could not resume")));
        assert_eq!(fixture.sessions.get_current_session_id("web:u1"), before);
    }

    #[tokio::test]
    async fn skills_list_without_registry_says_none_registered() {
        let fixture = Fixture::new();
        let outcome = route("/skills", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("No skills")));
    }

    struct FixedSkills(Vec<SkillSummary>);
    impl agentrt_domain::skill::SkillRegistry for FixedSkills {
        fn list(&self) -> Vec<SkillSummary> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn skills_command_transforms_text_with_resolved_name() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.skills = Some(Arc::new(FixedSkills(vec![SkillSummary {
            name: "deploy-check".into(),
            description: "pre-deploy checklist".into(),
        }])));
        let outcome = route("/skills deploy do it", &ctx).await;
        match outcome {
            RouterOutcome::Transformed(text) => {
                assert_eq!(text, "[use skill](deploy-check) do it")
            }
            _ => panic!("expected Transformed"),
        }
    }

    #[tokio::test]
    async fn compact_with_no_current_session_reports_it() {
        let fixture = Fixture::new();
        let outcome = route("/compact", &fixture.ctx()).await;
        assert!(matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("No current session")));
    }

    #[tokio::test]
    async fn compact_with_small_session_reports_no_trigger() {
        let fixture = Fixture::new();
        let (session, _) = fixture.sessions.get_or_create("web:u1", false);
        let mut ctx_session = session.context.clone();
        ctx_session.push(Message::user("hi"));
        fixture.sessions.save(&session.session_id, ctx_session).unwrap();

        struct NeverCalled;
        #[async_trait::async_trait]
        impl LlmProvider for NeverCalled {
            async fn chat(
                &self,
                _req: agentrt_providers::traits::ChatRequest,
            ) -> agentrt_domain::error::Result<agentrt_providers::traits::ChatResponse> {
                panic!("provider should not be called")
            }
            async fn chat_stream(
                &self,
                _req: agentrt_providers::traits::ChatRequest,
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

        let mut ctx = fixture.ctx();
        ctx.provider = Some(Arc::new(NeverCalled));
        let outcome = compact_command(&ctx).await;
        assert!(
            matches!(outcome, RouterOutcome::Handled(msg) if msg.contains("no compaction triggered"))
        );
    }
}

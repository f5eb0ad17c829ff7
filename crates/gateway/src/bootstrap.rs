//! Startup bring-up (C1/C3/C7/C10): parse config, construct every shared
//! service exactly once, and hand back the `AppState` every transport closes
//! over. Split out of `main.rs` so `cli::run`'s one-shot path and the long-
//! running server share the same bring-up path.

use std::sync::Arc;

use agentrt_domain::config::Config;
use agentrt_providers::registry::ProviderRegistry;
use agentrt_providers::LlmProvider;
use agentrt_sessions::{IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};

use crate::platform::http::StreamRegistry;
use crate::runtime::active_run::ActiveRunRegistry;
use crate::runtime::clarify::ClarificationHub;
use crate::runtime::plugins::{self, Plugin};
use crate::state::AppState;

/// Where session/transcript state lives on disk, relative to the config
/// file's directory. Kept simple (no `dataDir` config field) since this is
/// the only caller.
const STATE_DIRNAME: &str = "state";

/// Compiled-in plugins available for `config.plugins.enabled` to select
/// from. Empty for now — no first-party plugin ships yet, but the bring-up
/// path (and its abort-on-failure behavior) is exercised even with zero
/// plugins enabled.
fn available_plugins() -> Vec<Arc<dyn Plugin>> {
    Vec::new()
}

/// Resolve `config.llm.default_model` ("provider_id/model_name") into a
/// concrete provider handle plus the model name to request from it. Falls
/// back to the first registered provider with no model override when unset.
fn resolve_default_provider(
    config: &Config,
    registry: &ProviderRegistry,
) -> anyhow::Result<(Arc<dyn LlmProvider>, Option<String>)> {
    if let Some(spec) = &config.llm.default_model {
        let (provider_id, model) = spec
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("llm.default_model must be \"provider_id/model_name\", got \"{spec}\""))?;
        let provider = registry
            .get(provider_id)
            .ok_or_else(|| anyhow::anyhow!("llm.default_model references unknown provider \"{provider_id}\""))?;
        return Ok((provider, Some(model.to_string())));
    }

    let provider_id = registry
        .list_providers()
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no LLM providers configured and llm.default_model is unset"))?;
    let provider = registry.get(&provider_id).expect("just listed");
    Ok((provider, None))
}

/// Build every shared service and return the assembled `AppState`. Aborts
/// on any genuinely fatal condition (invalid config, plugin bring-up
/// failure); a provider that fails to initialize is not fatal by itself —
/// see `ProviderRegistry::from_config`'s `startup_policy` handling.
pub async fn build_app_state(config: Config, config_dir: &std::path::Path) -> anyhow::Result<AppState> {
    let issues = config.validate();
    let errors: Vec<_> = issues
        .iter()
        .filter(|e| e.severity == agentrt_domain::config::ConfigSeverity::Error)
        .collect();
    if !errors.is_empty() {
        for e in &issues {
            tracing::error!("{e}");
        }
        anyhow::bail!("{} configuration error(s), refusing to start", errors.len());
    }
    for e in issues
        .iter()
        .filter(|e| e.severity == agentrt_domain::config::ConfigSeverity::Warning)
    {
        tracing::warn!("{e}");
    }

    let config = Arc::new(config);
    let state_dir = config_dir.join(STATE_DIRNAME);
    std::fs::create_dir_all(&state_dir)?;

    let llm = Arc::new(ProviderRegistry::from_config(&config.llm)?);

    let available = available_plugins();
    let plugin_manager = plugins::initialize(&available, &config.plugins.enabled).await?;
    let plugins = Arc::new(plugin_manager);

    let sessions = Arc::new(SessionStore::new(&state_dir)?);
    let identity = Arc::new(IdentityResolver::from_config(&config.sessions.identity_links));
    let lifecycle = Arc::new(LifecycleManager::new(config.sessions.lifecycle.clone()));
    let transcripts = Arc::new(TranscriptWriter::new(&state_dir.join("transcripts")));

    let active_runs = Arc::new(ActiveRunRegistry::new());
    let clarifications = Arc::new(ClarificationHub::new());
    let stream_registry = Arc::new(StreamRegistry::new());

    let api_secret = resolve_secret_env(config.server.api_secret_env.as_deref());
    let internal_secret = resolve_secret_env(config.server.internal_secret_env.as_deref());

    Ok(AppState {
        config,
        llm,
        plugins,
        sessions,
        identity,
        lifecycle,
        transcripts,
        active_runs,
        clarifications,
        stream_registry,
        api_secret,
        internal_secret,
    })
}

fn resolve_secret_env(env_var: Option<&str>) -> Option<String> {
    env_var.and_then(|name| std::env::var(name).ok())
}

/// Resolve the provider/model a run should use absent a per-call override,
/// for callers (the CLI, the `/agent/run` handler) that build their own
/// `DispatcherDeps` via `AppState::dispatcher_deps`.
pub fn resolve_default_model(
    state: &AppState,
) -> anyhow::Result<(Arc<dyn LlmProvider>, Option<String>)> {
    resolve_default_provider(&state.config, &state.llm)
}

/// Spawn the periodic background sweeps every long-running server process
/// needs: session-store flush and stream-registry garbage collection.
/// Returns immediately; tasks run for the lifetime of the process.
pub fn spawn_background_tasks(state: &AppState) {
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(e) = sessions.flush() {
                tracing::error!(error = %e, "periodic session flush failed");
            }
        }
    });

    let stream_registry = state.stream_registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            stream_registry.sweep_done();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_domain::config::{AuthConfig, LlmConfig, ProviderConfig, ProviderKind};

    fn config_with_provider() -> Config {
        Config {
            llm: LlmConfig {
                default_model: Some("openai/gpt-4o".to_string()),
                providers: vec![ProviderConfig {
                    id: "openai".into(),
                    kind: ProviderKind::OpenaiCompat,
                    base_url: "https://example.invalid/v1".into(),
                    default_model: None,
                    context_window_tokens: None,
                    auth: AuthConfig {
                        key: Some("sk-test".into()),
                        env: None,
                    },
                }],
                ..LlmConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn resolve_default_provider_splits_provider_and_model() {
        let config = config_with_provider();
        let registry = ProviderRegistry::from_config(&config.llm).unwrap();
        let (provider, model) = resolve_default_provider(&config, &registry).unwrap();
        assert_eq!(provider.provider_id(), "openai");
        assert_eq!(model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn resolve_default_provider_errors_on_malformed_spec() {
        let mut config = config_with_provider();
        config.llm.default_model = Some("no-slash-here".to_string());
        let registry = ProviderRegistry::from_config(&config.llm).unwrap();
        assert!(resolve_default_provider(&config, &registry).is_err());
    }

    #[test]
    fn resolve_default_provider_errors_with_no_providers_and_no_default() {
        let config = Config::default();
        let registry = ProviderRegistry::from_config(&config.llm).unwrap();
        assert!(resolve_default_provider(&config, &registry).is_err());
    }

    #[tokio::test]
    async fn build_app_state_constructs_all_services() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_provider();
        let state = build_app_state(config, dir.path()).await.unwrap();
        assert_eq!(state.llm.len(), 1);
        assert!(state.api_secret.is_none());
    }

    #[tokio::test]
    async fn build_app_state_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.port = 0;
        let err = build_app_state(config, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("configuration error"));
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider configuration (C3)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_20000u")]
    pub default_timeout_ms: u64,
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Whether startup requires at least one provider to initialize.
    #[serde(default)]
    pub startup_policy: LlmStartupPolicy,
    /// Default provider/model to use when a run does not override it.
    /// Format: `"provider_id/model_name"`.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Registered LLM providers (data-driven: adding a provider = adding config).
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 20_000,
            max_retries: 2,
            startup_policy: LlmStartupPolicy::AllowNone,
            default_model: None,
            providers: Vec::new(),
        }
    }
}

/// Controls how the gateway handles LLM provider initialization at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmStartupPolicy {
    /// Gateway boots even if no LLM providers initialize; LLM-backed routes
    /// return errors until credentials are configured.
    #[default]
    AllowNone,
    /// Abort startup if no LLM providers successfully initialize.
    RequireOne,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub context_window_tokens: Option<u32>,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Direct key (for config-only setups; prefer `env`).
    #[serde(default)]
    pub key: Option<String>,
    /// Env var containing the key. Takes precedence when `key` is absent.
    #[serde(default)]
    pub env: Option<String>,
}

impl AuthConfig {
    /// Two-tier secret resolution: explicit `key`, else `env::var(env)`.
    pub fn resolve(&self) -> Option<String> {
        if let Some(k) = &self.key {
            return Some(k.clone());
        }
        self.env.as_deref().and_then(|name| std::env::var(name).ok())
    }
}

/// Model role assignments (e.g. "summarizer" used by the compactor).
/// Format: `"provider_id/model_name"`.
pub type RoleMap = HashMap<String, String>;

fn d_20000u() -> u64 {
    20_000
}
fn d_2() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_providers() {
        assert!(LlmConfig::default().providers.is_empty());
    }

    #[test]
    fn auth_resolve_prefers_explicit_key() {
        let auth = AuthConfig {
            key: Some("sk-direct".into()),
            env: Some("SOME_ENV_THAT_DOES_NOT_EXIST".into()),
        };
        assert_eq!(auth.resolve().as_deref(), Some("sk-direct"));
    }

    #[test]
    fn auth_resolve_falls_back_to_env() {
        std::env::set_var("AGENTRT_TEST_PROVIDER_KEY", "sk-from-env");
        let auth = AuthConfig {
            key: None,
            env: Some("AGENTRT_TEST_PROVIDER_KEY".into()),
        };
        assert_eq!(auth.resolve().as_deref(), Some("sk-from-env"));
        std::env::remove_var("AGENTRT_TEST_PROVIDER_KEY");
    }

    #[test]
    fn provider_config_deserializes() {
        let json = r#"{
            "id": "openai",
            "kind": "openai_compat",
            "base_url": "https://api.openai.com/v1",
            "auth": { "env": "OPENAI_API_KEY" }
        }"#;
        let pc: ProviderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(pc.kind, ProviderKind::OpenaiCompat);
        assert_eq!(pc.auth.env.as_deref(), Some("OPENAI_API_KEY"));
    }
}

//! Provider registry.
//!
//! Constructs and holds all configured LLM provider instances. At startup the
//! registry reads the [`LlmConfig`], resolves authentication (env vars, direct
//! keys), and instantiates the appropriate adapter for each configured provider.

use crate::anthropic::AnthropicProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;
use agentrt_domain::config::{LlmConfig, LlmStartupPolicy, ProviderKind};
use agentrt_domain::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds all instantiated LLM providers.
///
/// When the startup policy is `allow_none`, the registry also records
/// initialization errors so they can be surfaced in a readiness endpoint.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// Provider IDs that failed to initialize, with their error messages.
    init_errors: Vec<ProviderInitError>,
}

/// Records a provider that failed to initialize.
#[derive(Debug, Clone)]
pub struct ProviderInitError {
    pub provider_id: String,
    pub kind: String,
    /// Error message with any potential secrets masked.
    pub error: String,
}

/// Mask substrings that look like API keys or bearer tokens in an error
/// message before they reach logs or readiness endpoints.
fn mask_secrets(msg: &str) -> String {
    let mut result = msg.to_string();
    for word in msg.split(|c: char| c.is_whitespace() || c == '\'' || c == '"' || c == ',') {
        let trimmed = word.trim();
        if trimmed.len() >= 20
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            let masked = if trimmed.len() > 8 {
                format!("{}...{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
            } else {
                "***masked***".to_string()
            };
            result = result.replace(trimmed, &masked);
        }
    }
    result
}

impl ProviderRegistry {
    /// Build the registry from the application's [`LlmConfig`].
    ///
    /// Each entry in `config.providers` is instantiated using the adapter
    /// matching its `kind`. Auth keys are resolved eagerly (env vars are read
    /// at this point).
    ///
    /// Providers that fail to initialize are logged and skipped rather than
    /// aborting the entire startup.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut init_errors: Vec<ProviderInitError> = Vec::new();

        for pc in &config.providers {
            let result: Result<Arc<dyn LlmProvider>> = match pc.kind {
                ProviderKind::OpenaiCompat => OpenAiCompatProvider::from_config(pc)
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                ProviderKind::Anthropic => {
                    AnthropicProvider::from_config(pc).map(|p| Arc::new(p) as Arc<dyn LlmProvider>)
                }
            };

            match result {
                Ok(provider) => {
                    tracing::info!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        "registered LLM provider"
                    );
                    providers.insert(pc.id.clone(), provider);
                }
                Err(e) => {
                    let safe_error = mask_secrets(&e.to_string());
                    tracing::warn!(
                        provider_id = %pc.id,
                        kind = ?pc.kind,
                        error = %safe_error,
                        "failed to initialize LLM provider, skipping"
                    );
                    init_errors.push(ProviderInitError {
                        provider_id: pc.id.clone(),
                        kind: format!("{:?}", pc.kind),
                        error: safe_error,
                    });
                }
            }
        }

        if providers.is_empty() && !config.providers.is_empty() {
            match config.startup_policy {
                LlmStartupPolicy::RequireOne => {
                    return Err(Error::Config(
                        "all configured LLM providers failed to initialize \
                         (startup_policy = require_one)"
                            .into(),
                    ));
                }
                LlmStartupPolicy::AllowNone => {
                    tracing::warn!(
                        failed_providers = init_errors.len(),
                        "no LLM providers initialized (startup_policy = allow_none); \
                         gateway will boot but LLM-backed routes will fail until auth \
                         is configured"
                    );
                }
            }
        }

        Ok(Self {
            providers,
            init_errors,
        })
    }

    /// Look up a provider by its config id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(provider_id).cloned()
    }

    /// Iterate over all registered providers.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn LlmProvider>)> {
        self.providers.iter()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// List all registered provider IDs (sorted).
    pub fn list_providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Provider initialization errors (empty if all succeeded).
    ///
    /// Surfaced via a readiness endpoint so operators can diagnose missing
    /// API keys or misconfigured providers without scraping startup logs.
    pub fn init_errors(&self) -> &[ProviderInitError] {
        &self.init_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrt_domain::config::{AuthConfig, ProviderConfig};

    fn provider_config(id: &str, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind,
            base_url: "https://example.invalid/v1".into(),
            default_model: None,
            context_window_tokens: None,
            auth: AuthConfig {
                key: Some("sk-test".into()),
                env: None,
            },
        }
    }

    #[test]
    fn empty_config_produces_empty_registry() {
        let registry = ProviderRegistry::from_config(&LlmConfig::default()).unwrap();
        assert!(registry.is_empty());
        assert!(registry.init_errors().is_empty());
    }

    #[test]
    fn registers_configured_providers() {
        let cfg = LlmConfig {
            providers: vec![provider_config("openai", ProviderKind::OpenaiCompat)],
            ..LlmConfig::default()
        };
        let registry = ProviderRegistry::from_config(&cfg).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("openai").is_some());
    }

    #[test]
    fn mask_secrets_redacts_long_tokens() {
        let masked = mask_secrets("request failed with key sk-abcdefghijklmnopqrstuvwxyz");
        assert!(!masked.contains("abcdefghijklmnopqrstuvwxyz"));
    }
}

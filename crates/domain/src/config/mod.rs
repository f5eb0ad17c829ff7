mod compaction;
mod llm;
mod loop_bounds;
mod observability;
mod plugins;
mod server;
mod sessions;

pub use compaction::*;
pub use llm::*;
pub use loop_bounds::*;
pub use observability::*;
pub use plugins::*;
pub use server::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub loop_bounds: LoopBoundsConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. Errors abort
    /// boot; warnings only log.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.llm.providers.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no LLM providers configured".into(),
            });
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: "provider id must not be empty".into(),
                });
            }
            if provider.base_url.is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: "provider base_url must not be empty".into(),
                });
            } else if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: format!(
                        "base_url must start with http:// or https:// (got \"{}\")",
                        provider.base_url
                    ),
                });
            }

            if !provider.id.is_empty() && !seen_ids.insert(&provider.id) {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.providers[{i}].id"),
                    message: format!(
                        "duplicate provider id \"{}\" — later provider will shadow earlier one",
                        provider.id
                    ),
                });
            }

            let has_credentials = provider.auth.key.as_ref().is_some_and(|v| !v.is_empty())
                || provider.auth.env.as_ref().is_some_and(|v| !v.is_empty());
            if !has_credentials {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].auth"),
                    message: format!(
                        "provider \"{}\" has no auth.env or auth.key configured",
                        provider.id
                    ),
                });
            }
        }

        if self.server.cors.allowed_origins.len() == 1 && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.max_concurrent_requests".into(),
                message: "must be greater than 0".into(),
            });
        }

        // Compaction sanity: 0 < target < trigger <= window.
        let trigger = self.compaction.trigger_tokens();
        let target = self.compaction.target_tokens();
        if target == 0 || trigger == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "compaction".into(),
                message: "compact_trigger and compact_target must be greater than 0".into(),
            });
        } else if target >= trigger {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "compaction".into(),
                message: format!(
                    "compact_target ({target}) must be less than compact_trigger ({trigger})"
                ),
            });
        }
        if self.compaction.keep_last_turns == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "compaction.keep_last_turns".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.loop_bounds.max_steps == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "loop_bounds.max_steps".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.loop_bounds.max_error_count == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "loop_bounds.max_error_count".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}

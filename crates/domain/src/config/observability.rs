use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability (A2): structured logging configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    /// `tracing_subscriber::EnvFilter` directive string. Defaults to
    /// `"info,agentrt_gateway=debug"` when unset.
    #[serde(default = "d_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Json,
            log_level: d_log_level(),
        }
    }
}

fn d_log_level() -> String {
    "info,agentrt_gateway=debug".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_json() {
        assert_eq!(ObservabilityConfig::default().log_format, LogFormat::Json);
    }

    #[test]
    fn deserialize_empty_uses_defaults() {
        let cfg: ObservabilityConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.log_level, "info,agentrt_gateway=debug");
    }

    #[test]
    fn deserialize_pretty_format() {
        let cfg: ObservabilityConfig = toml::from_str("log_format = \"pretty\"").unwrap();
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }
}

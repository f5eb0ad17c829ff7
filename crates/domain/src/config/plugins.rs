use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plugin manager (C10) bring-up list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ordered list of built-in plugin names to initialize at boot. No dynamic
/// loading — plugins are compiled into the binary; this config only
/// controls which of them participate and lets the dependency-sort see a
/// stable, caller-provided starting order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enables_nothing() {
        assert!(PluginsConfig::default().enabled.is_empty());
    }
}

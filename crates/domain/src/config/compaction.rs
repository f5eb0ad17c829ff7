use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context compactor (C2) thresholds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Token budget considered the full context window, used to derive the
    /// trigger/target thresholds below when they are not set explicitly.
    #[serde(default = "d_window")]
    pub context_window_tokens: usize,
    /// Estimated-token trigger threshold. Defaults to 0.75 × window.
    #[serde(default)]
    pub compact_trigger: Option<usize>,
    /// Estimated-token target threshold after compaction. Defaults to
    /// 0.50 × window.
    #[serde(default)]
    pub compact_target: Option<usize>,
    /// Number of most-recent user turns always kept verbatim.
    #[serde(default = "d_6")]
    pub keep_last_turns: usize,
    /// Maximum compaction attempts within a single loop run.
    #[serde(default = "d_2")]
    pub max_compaction_attempts: u32,
    /// Upper bound (in estimated tokens) requested of the summarization call.
    #[serde(default = "d_512")]
    pub summary_max_tokens: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: d_window(),
            compact_trigger: None,
            compact_target: None,
            keep_last_turns: d_6(),
            max_compaction_attempts: d_2(),
            summary_max_tokens: d_512(),
        }
    }
}

impl CompactionConfig {
    pub fn trigger_tokens(&self) -> usize {
        self.compact_trigger
            .unwrap_or((self.context_window_tokens as f64 * 0.75) as usize)
    }

    pub fn target_tokens(&self) -> usize {
        self.compact_target
            .unwrap_or((self.context_window_tokens as f64 * 0.50) as usize)
    }
}

fn d_window() -> usize {
    128_000
}
fn d_6() -> usize {
    6
}
fn d_2() -> u32 {
    2
}
fn d_512() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_defaults_to_three_quarters_of_window() {
        let cfg = CompactionConfig::default();
        assert_eq!(cfg.trigger_tokens(), 96_000);
    }

    #[test]
    fn target_defaults_to_half_of_window() {
        let cfg = CompactionConfig::default();
        assert_eq!(cfg.target_tokens(), 64_000);
    }

    #[test]
    fn explicit_thresholds_override_derived_ones() {
        let cfg = CompactionConfig {
            compact_trigger: Some(1000),
            compact_target: Some(500),
            ..CompactionConfig::default()
        };
        assert_eq!(cfg.trigger_tokens(), 1000);
        assert_eq!(cfg.target_tokens(), 500);
    }
}

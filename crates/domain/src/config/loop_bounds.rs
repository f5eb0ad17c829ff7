use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop (C6) bounds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopBoundsConfig {
    #[serde(default = "d_max_errors")]
    pub max_error_count: u32,
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
}

impl Default for LoopBoundsConfig {
    fn default() -> Self {
        Self {
            max_error_count: d_max_errors(),
            max_steps: d_max_steps(),
        }
    }
}

fn d_max_errors() -> u32 {
    3
}
fn d_max_steps() -> u32 {
    50
}

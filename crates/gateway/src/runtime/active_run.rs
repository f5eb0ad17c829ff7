//! Active-run registry (C8) — tracks at most one in-flight run per
//! `platformKey`, guaranteeing the dispatcher's busy-gate invariant.
//!
//! Deliberately simpler than a session-lock semaphore: a second request for
//! a busy `platformKey` is rejected immediately rather than queued.

use std::collections::HashMap;
use std::sync::Arc;

use agentrt_domain::session::ActiveRun;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Result of `abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortOutcome {
    pub aborted: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// Thread-safe `platformKey -> ActiveRun` map.
#[derive(Default)]
pub struct ActiveRunRegistry {
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_active_run(&self, platform_key: &str) -> bool {
        self.runs.lock().contains_key(platform_key)
    }

    pub fn get_active_run(&self, platform_key: &str) -> Option<ActiveRun> {
        self.runs.lock().get(platform_key).cloned()
    }

    /// Atomically insert an ActiveRun iff none is present for this key.
    /// Returns `true` if the run was recorded, `false` if one was already
    /// active (the caller must treat this as the busy-gate signal).
    pub fn set_active_run(&self, run: ActiveRun) -> bool {
        let mut runs = self.runs.lock();
        match runs.entry(run.platform_key.clone()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(run);
                true
            }
        }
    }

    pub fn clear_active_run(&self, platform_key: &str) {
        self.runs.lock().remove(platform_key);
    }

    /// Fire the cancellation handle for the active run, if any. Idempotent:
    /// calling this twice in a row returns `{aborted: false}` on the second
    /// call because the run is cleared once it actually terminates, but the
    /// cancellation signal itself tolerates repeated `cancel()` calls.
    pub fn abort_active_run(&self, platform_key: &str) -> AbortOutcome {
        let runs = self.runs.lock();
        match runs.get(platform_key) {
            Some(run) => {
                run.cancel.cancel();
                AbortOutcome {
                    aborted: true,
                    started_at: Some(run.started_at),
                }
            }
            None => AbortOutcome {
                aborted: false,
                started_at: None,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

pub type SharedActiveRunRegistry = Arc<ActiveRunRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_active_run_rejects_second_for_same_key() {
        let registry = ActiveRunRegistry::new();
        let run1 = ActiveRun::new("stream-1", "web:u1");
        let run2 = ActiveRun::new("stream-2", "web:u1");
        assert!(registry.set_active_run(run1));
        assert!(!registry.set_active_run(run2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn different_platform_keys_both_succeed() {
        let registry = ActiveRunRegistry::new();
        assert!(registry.set_active_run(ActiveRun::new("s1", "web:u1")));
        assert!(registry.set_active_run(ActiveRun::new("s2", "web:u2")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn abort_missing_key_is_not_aborted() {
        let registry = ActiveRunRegistry::new();
        let outcome = registry.abort_active_run("nope");
        assert_eq!(
            outcome,
            AbortOutcome {
                aborted: false,
                started_at: None
            }
        );
    }

    #[test]
    fn abort_fires_cancel_token_and_is_idempotent_after_clear() {
        let registry = ActiveRunRegistry::new();
        let run = ActiveRun::new("s1", "web:u1");
        let cancel = run.cancel.clone();
        registry.set_active_run(run);

        let outcome = registry.abort_active_run("web:u1");
        assert!(outcome.aborted);
        assert!(cancel.is_cancelled());

        registry.clear_active_run("web:u1");
        let second = registry.abort_active_run("web:u1");
        assert!(!second.aborted);
    }

    #[test]
    fn clear_then_has_active_run_is_false() {
        let registry = ActiveRunRegistry::new();
        registry.set_active_run(ActiveRun::new("s1", "web:u1"));
        assert!(registry.has_active_run("web:u1"));
        registry.clear_active_run("web:u1");
        assert!(!registry.has_active_run("web:u1"));
    }
}

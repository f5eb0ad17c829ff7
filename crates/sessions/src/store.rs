//! Gateway-owned session store (C7).
//!
//! Persists session state in `sessions.json` under the configured state path.
//! Each platform key tracks zero or more sessions plus a pointer to the
//! session currently considered "current" for that key. All operations are
//! atomic per platform key (backed by a single `RwLock`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use agentrt_domain::error::{Error, Result};
use agentrt_domain::session::Session;
use agentrt_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PlatformState {
    current_session_id: Option<String>,
    sessions: HashMap<String, Session>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedState {
    platforms: HashMap<String, PlatformState>,
}

/// Summary row returned by [`SessionStore::list_sessions`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub preview: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`SessionStore::get_current_status`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`SessionStore::attach`].
#[derive(Debug, Clone, Serialize)]
pub struct AttachOutcome {
    pub ok: bool,
    pub reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Gateway-owned session store backed by a JSON file.
pub struct SessionStore {
    sessions_path: PathBuf,
    state: RwLock<PersistedState>,
}

impl SessionStore {
    /// Load or create the session store at `state_path/sessions/sessions.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let sessions_path = dir.join("sessions.json");
        let state: PersistedState = if sessions_path.exists() {
            let raw = std::fs::read_to_string(&sessions_path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            PersistedState::default()
        };

        tracing::info!(
            platforms = state.platforms.len(),
            path = %sessions_path.display(),
            "session store loaded"
        );

        Ok(Self {
            sessions_path,
            state: RwLock::new(state),
        })
    }

    /// Resolve the current session for `platform_key`, creating one if none
    /// exists yet, or if `force_new` is set. Returns `(session, is_new)`.
    pub fn get_or_create(&self, platform_key: &str, force_new: bool) -> (Session, bool) {
        if !force_new {
            let state = self.state.read();
            if let Some(platform) = state.platforms.get(platform_key) {
                if let Some(current_id) = &platform.current_session_id {
                    if let Some(session) = platform.sessions.get(current_id) {
                        return (session.clone(), false);
                    }
                }
            }
        }

        let session = self.create_new_session_entry(platform_key);
        TraceEvent::SessionResolved {
            platform_key: platform_key.to_owned(),
            session_id: session.session_id.clone(),
            is_new: true,
        }
        .emit();
        (session, true)
    }

    /// Create a brand new session for `platform_key` and make it current.
    pub fn create_new_session(&self, platform_key: &str) -> String {
        self.create_new_session_entry(platform_key).session_id
    }

    fn create_new_session_entry(&self, platform_key: &str) -> Session {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(session_id, platform_key.to_owned());
        let mut state = self.state.write();
        let platform = state.platforms.entry(platform_key.to_owned()).or_default();
        platform.current_session_id = Some(session.session_id.clone());
        platform
            .sessions
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Persist an updated context back into its owning session.
    pub fn save(&self, session_id: &str, context: agentrt_domain::session::Context) -> Result<()> {
        let mut state = self.state.write();
        for platform in state.platforms.values_mut() {
            if let Some(session) = platform.sessions.get_mut(session_id) {
                session.context = context;
                session.updated_at = Utc::now();
                return Ok(());
            }
        }
        Err(Error::Other(format!("unknown session id: {session_id}")))
    }

    /// Mint a fresh current session for `platform_key`, discarding the old
    /// pointer (the old session itself is retained in history).
    pub fn clear_current(&self, platform_key: &str) -> (String, bool) {
        let old_id = self.get_current_session_id(platform_key);
        let session = self.create_new_session_entry(platform_key);

        if let Some(old_id) = old_id {
            TraceEvent::SessionReset {
                platform_key: platform_key.to_owned(),
                old_session_id: old_id,
                new_session_id: session.session_id.clone(),
                reason: "clear_current".into(),
            }
            .emit();
        }

        (session.session_id, true)
    }

    /// Look up the current session for `platform_key`, if any.
    pub fn get_current(&self, platform_key: &str) -> Option<Session> {
        let state = self.state.read();
        let platform = state.platforms.get(platform_key)?;
        let id = platform.current_session_id.as_ref()?;
        platform.sessions.get(id).cloned()
    }

    /// The current session id for `platform_key`, if any.
    pub fn get_current_session_id(&self, platform_key: &str) -> Option<String> {
        let state = self.state.read();
        state.platforms.get(platform_key)?.current_session_id.clone()
    }

    /// Lightweight status projection of the current session.
    pub fn get_current_status(&self, platform_key: &str) -> Option<SessionStatus> {
        let session = self.get_current(platform_key)?;
        Some(SessionStatus {
            session_id: session.session_id,
            message_count: session.message_count(),
            updated_at: session.updated_at,
        })
    }

    /// List sessions for `platform_key`, newest first, capped at `limit`.
    pub fn list_sessions(&self, platform_key: &str, limit: usize) -> Vec<SessionSummary> {
        let state = self.state.read();
        let Some(platform) = state.platforms.get(platform_key) else {
            return Vec::new();
        };

        let mut sessions: Vec<&Session> = platform.sessions.values().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
            .into_iter()
            .take(limit)
            .map(|s| SessionSummary {
                id: s.session_id.clone(),
                preview: s.preview(),
                message_count: s.message_count(),
                updated_at: s.updated_at,
            })
            .collect()
    }

    /// Make `session_id` the current session for `platform_key`. Fails (without
    /// promoting anything) if that session does not belong to this platform key.
    pub fn attach(&self, platform_key: &str, session_id: &str) -> AttachOutcome {
        let mut state = self.state.write();
        let Some(platform) = state.platforms.get_mut(platform_key) else {
            return AttachOutcome {
                ok: false,
                reason: Some("unknown platform key".into()),
            };
        };
        if !platform.sessions.contains_key(session_id) {
            return AttachOutcome {
                ok: false,
                reason: Some("session does not belong to this platform key".into()),
            };
        }
        platform.current_session_id = Some(session_id.to_owned());
        AttachOutcome {
            ok: true,
            reason: None,
        }
    }

    /// Persist the current session state to disk.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.read();
        let json = serde_json::to_string_pretty(&*state)
            .map_err(|e| Error::Other(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.sessions_path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(tempfile::tempdir().unwrap().path()).unwrap()
    }

    #[test]
    fn get_or_create_creates_then_reuses() {
        let store = store();
        let (a, a_new) = store.get_or_create("web:alice", false);
        assert!(a_new);
        let (b, b_new) = store.get_or_create("web:alice", false);
        assert!(!b_new);
        assert_eq!(a.session_id, b.session_id);
    }

    #[test]
    fn force_new_mints_a_fresh_session() {
        let store = store();
        let (a, _) = store.get_or_create("web:alice", false);
        let (b, b_new) = store.get_or_create("web:alice", true);
        assert!(b_new);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn clear_current_keeps_old_session_in_history() {
        let store = store();
        let (old, _) = store.get_or_create("web:alice", false);
        let (new_id, created) = store.clear_current("web:alice");
        assert!(created);
        assert_ne!(new_id, old.session_id);
        assert_eq!(store.list_sessions("web:alice", 10).len(), 2);
    }

    #[test]
    fn attach_rejects_foreign_session() {
        let store = store();
        store.get_or_create("web:alice", false);
        let (bob_session, _) = store.get_or_create("web:bob", false);
        let outcome = store.attach("web:alice", &bob_session.session_id);
        assert!(!outcome.ok);
        assert_eq!(
            store.get_current_session_id("web:alice"),
            store.get_current("web:alice").map(|s| s.session_id)
        );
    }

    #[test]
    fn attach_promotes_existing_session() {
        let store = store();
        let (first, _) = store.get_or_create("web:alice", false);
        let (second, _) = store.get_or_create("web:alice", true);
        assert_ne!(first.session_id, second.session_id);

        let outcome = store.attach("web:alice", &first.session_id);
        assert!(outcome.ok);
        assert_eq!(
            store.get_current_session_id("web:alice"),
            Some(first.session_id)
        );
    }

    #[test]
    fn list_sessions_orders_newest_first() {
        let store = store();
        let (first, _) = store.get_or_create("web:alice", false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (second, _) = store.get_or_create("web:alice", true);

        let listed = store.list_sessions("web:alice", 10);
        assert_eq!(listed[0].id, second.session_id);
        assert_eq!(listed[1].id, first.session_id);
    }
}

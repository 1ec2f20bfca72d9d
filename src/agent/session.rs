//! Persona session registry.
//!
//! Providers that support session resumption get consecutive phases of a
//! movement (and consecutive movements of the same persona) running in one
//! provider context. Sessions are keyed by worktree, persona, and
//! provider, so switching provider never resumes a foreign session.

use std::path::{Path, PathBuf};

use dashmap::DashMap;
use tracing::debug;

/// Identity of one resumable provider session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub worktree: PathBuf,
    pub persona: String,
    pub provider: String,
}

impl SessionKey {
    pub fn new(worktree: &Path, persona: &str, provider: &str) -> Self {
        Self {
            worktree: worktree.to_path_buf(),
            persona: persona.to_string(),
            provider: provider.to_string(),
        }
    }
}

/// Concurrent map of resumable session ids
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session id to resume for this key, when one is known
    pub fn resume_id(&self, key: &SessionKey) -> Option<String> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Record the session id a provider response carried
    pub fn record(&self, key: &SessionKey, session_id: Option<&str>) {
        if let Some(id) = session_id {
            debug!(
                "Recording session {} for persona '{}' ({})",
                id, key.persona, key.provider
            );
            self.sessions.insert(key.clone(), id.to_string());
        }
    }

    /// Drop a stored session id
    pub fn invalidate(&self, key: &SessionKey) {
        self.sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! Chunked-upload session store (spec.md §4.10, §3 "Deployment session").
//!
//! A single-writer accumulator keyed by an opaque session id. At most 10
//! concurrent sessions; creating an 11th evicts the oldest by creation
//! time. Sessions idle beyond 30 minutes are evicted lazily on the next
//! store access (no background sweeper — this mirrors the teacher's
//! preference for request-scoped work over long-lived background tasks).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use gethostname::gethostname;
use wharf_types::{DeploymentSession, SessionFile};

pub const MAX_SESSIONS: usize = 10;
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Thread-safe handle to the session store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<BTreeMap<String, DeploymentSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    /// Create a session for the first chunk of an upload (no session id
    /// supplied by the caller). Evicts stale sessions first; evicts the
    /// oldest live session if the store is already at capacity.
    pub fn create(&self, files: Vec<SessionFile>, deletions: Vec<String>, expected_files: Option<usize>) -> DeploymentSession {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        evict_expired(&mut sessions);

        if sessions.len() >= MAX_SESSIONS {
            if let Some(oldest_id) = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.clone())
            {
                sessions.remove(&oldest_id);
            }
        }

        let id = new_session_id();
        let mut session = DeploymentSession::new(id.clone(), Utc::now(), expected_files);
        session.files = files;
        session.deletions = deletions;
        sessions.insert(id, session.clone());
        session
    }

    /// Append a chunk's files to an existing session. Deletions are only
    /// accepted on the first chunk (spec.md §4.10 invariant) — callers
    /// pass `None` on subsequent chunks.
    pub fn append(&self, session_id: &str, mut files: Vec<SessionFile>) -> Option<DeploymentSession> {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        evict_expired(&mut sessions);
        let session = sessions.get_mut(session_id)?;
        session.files.append(&mut files);
        Some(session.clone())
    }

    /// Remove and return a session (used on commit or on explicit cancel).
    pub fn take(&self, session_id: &str) -> Option<DeploymentSession> {
        self.inner.lock().expect("session mutex poisoned").remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<DeploymentSession> {
        let mut sessions = self.inner.lock().expect("session mutex poisoned");
        evict_expired(&mut sessions);
        sessions.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_expired(sessions: &mut BTreeMap<String, DeploymentSession>) {
    let now = Utc::now();
    sessions.retain(|_, session| {
        let age = now - session.created_at;
        age.to_std().map(|age| age < SESSION_IDLE_TIMEOUT).unwrap_or(true)
    });
}

fn new_session_id() -> String {
    let now = Utc::now();
    format!(
        "sess-{}-{}-{}",
        gethostname().to_string_lossy(),
        now.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str) -> SessionFile {
        SessionFile { path: path.into(), content_b64: "".into() }
    }

    #[test]
    fn create_then_append_accumulates_files_in_order() {
        let store = SessionStore::new();
        let session = store.create(vec![file("a")], vec!["deleted.txt".into()], Some(3));
        store.append(&session.id, vec![file("b")]);
        let updated = store.append(&session.id, vec![file("c")]).expect("append");

        assert_eq!(
            updated.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(updated.deletions, vec!["deleted.txt".to_string()]);
    }

    #[test]
    fn take_removes_session_from_store() {
        let store = SessionStore::new();
        let session = store.create(vec![], vec![], None);
        assert_eq!(store.len(), 1);

        let taken = store.take(&session.id);
        assert!(taken.is_some());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn append_to_unknown_session_returns_none() {
        let store = SessionStore::new();
        assert!(store.append("does-not-exist", vec![file("a")]).is_none());
    }

    #[test]
    fn eleventh_session_evicts_the_oldest() {
        let store = SessionStore::new();
        let mut ids = Vec::new();
        for _ in 0..MAX_SESSIONS {
            let s = store.create(vec![], vec![], None);
            ids.push(s.id);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(store.len(), MAX_SESSIONS);

        let eleventh = store.create(vec![], vec![], None);
        assert_eq!(store.len(), MAX_SESSIONS);
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&eleventh.id).is_some());
    }
}

//! Table of live sessions keyed by tunnel id.

use std::collections::HashMap;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::Session;

/// Owns every session of one embedder.
///
/// The lock only guards the map. Session calls (which may block on the
/// engine) always happen on a snapshot taken outside it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails when its id is taken.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let id = session.id().to_string();
        if sessions.contains_key(&id) {
            return Err(Error::DuplicateTunnel(id));
        }
        sessions.insert(id.clone(), session);
        debug!(tunnel = %id, total = sessions.len(), "Session registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Unregister and hand back the session. The caller decides whether to destroy it.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().remove(id);
        if removed.is_some() {
            debug!(tunnel = %id, "Session unregistered");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Application end of the tunnel's packet channel.
    pub fn app_descriptor(&self, id: &str) -> Result<RawFd> {
        self.get(id)
            .ok_or_else(|| Error::UnknownTunnel(id.to_string()))?
            .app_descriptor()
    }

    /// Owned duplicate of the tunnel's application end, for callers that
    /// close it themselves.
    pub fn take_app_descriptor(&self, id: &str) -> Result<OwnedFd> {
        self.get(id)
            .ok_or_else(|| Error::UnknownTunnel(id.to_string()))?
            .take_app_descriptor()
    }

    /// Soft-reconnect every active session after a network change.
    ///
    /// Returns how many sessions actually reconnected.
    pub fn reconnect_all(&self) -> usize {
        let sessions = self.snapshot();
        let mut count = 0;
        for session in &sessions {
            match session.reconnect() {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => warn!(tunnel = %session.id(), error = %e, "Reconnect failed"),
            }
        }
        info!(reconnected = count, total = sessions.len(), "Reconnect all");
        count
    }

    /// Destroy and drop every session.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        for session in &drained {
            session.destroy();
        }
        info!(count = drained.len(), "Registry shut down");
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::LoopbackBuilder;

    fn session(id: &str) -> Arc<Session> {
        Session::create(
            id,
            &LoopbackBuilder::default(),
            None,
            None,
            SessionConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());
        registry.insert(session("uk-1")).unwrap();
        registry.insert(session("fr-1")).unwrap();

        let err = registry.insert(session("uk-1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTunnel(ref id) if id == "uk-1"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["fr-1", "uk-1"]);

        assert!(matches!(
            registry.app_descriptor("nope"),
            Err(Error::UnknownTunnel(_))
        ));
        assert!(matches!(
            registry.app_descriptor("uk-1"),
            Err(Error::NotReady)
        ));

        let removed = registry.remove("uk-1").unwrap();
        assert_eq!(removed.id(), "uk-1");
        assert!(registry.remove("uk-1").is_none());
        assert!(!registry.contains("uk-1"));
        assert!(registry.get("fr-1").is_some());
    }

    #[test]
    fn test_reconnect_all_skips_idle_sessions() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap();
        registry.insert(session("b")).unwrap();

        assert_eq!(registry.reconnect_all(), 0);
        for id in registry.ids() {
            let s = registry.get(&id).unwrap();
            assert_eq!(s.reconnect_count(), 0);
            assert_eq!(s.state(), crate::session::SessionState::Idle);
        }
    }

    #[test]
    fn test_shutdown_destroys_sessions() {
        let registry = SessionRegistry::new();
        let s = session("x");
        registry.insert(s.clone()).unwrap();
        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(s.state(), crate::session::SessionState::Destroyed);
        registry.shutdown();
    }
}

//! Registry of running sessions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::crypto::SessionId;

/// Shared set of sessions that are currently running.
///
/// Cheap to clone; every clone sees the same set.
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions {
    ids: Arc<Mutex<HashSet<SessionId>>>,
}

impl ActiveSessions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Returns false if it was already registered.
    pub fn insert(&self, id: SessionId) -> bool {
        self.ids.lock().map(|mut ids| ids.insert(id)).unwrap_or(false)
    }

    /// Unregister a session. Returns false if it was not registered.
    pub fn remove(&self, id: &SessionId) -> bool {
        self.ids.lock().map(|mut ids| ids.remove(id)).unwrap_or(false)
    }

    /// Whether the session is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.ids.lock().map(|ids| ids.contains(id)).unwrap_or(false)
    }

    /// Number of running sessions.
    pub fn len(&self) -> usize {
        self.ids.lock().map(|ids| ids.len()).unwrap_or(0)
    }

    /// Whether no session is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

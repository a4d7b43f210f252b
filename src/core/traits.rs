//! Collaborator traits.
//!
//! The core does not persist key material itself; embedders plug in a
//! [`KeyStore`] backed by whatever storage the platform provides.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::crypto::SessionId;

use super::constants::PRIVATE_KEY_SIZE;

/// Persistent storage for the long-lived private key of a pairing.
///
/// A freshly generated key is stored before it is used for the first
/// time, so that a later connect for the same peer restores the same
/// identity.
pub trait KeyStore: Send + Sync + 'static {
    /// Load the private key persisted for `session`.
    fn load_private_key(&self, session: &SessionId) -> Option<[u8; PRIVATE_KEY_SIZE]>;

    /// Persist the private key for `session`.
    fn store_private_key(&self, session: &SessionId, key: [u8; PRIVATE_KEY_SIZE]);

    /// Delete everything persisted for `session`.
    fn forget(&self, session: &SessionId);
}

/// In-memory [`KeyStore`].
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<SessionId, [u8; PRIVATE_KEY_SIZE]>>,
}

impl MemoryKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted keys.
    pub fn len(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_private_key(&self, session: &SessionId) -> Option<[u8; PRIVATE_KEY_SIZE]> {
        self.keys.lock().ok()?.get(session).copied()
    }

    fn store_private_key(&self, session: &SessionId, key: [u8; PRIVATE_KEY_SIZE]) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.insert(*session, key);
        }
    }

    fn forget(&self, session: &SessionId) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(session);
        }
    }
}

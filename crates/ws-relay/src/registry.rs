use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionId};

/// A registered provider: its live connection and the secret consumers must
/// present.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub connection: Arc<Connection>,
    pub secret: String,
}

/// Process-wide map from provider identity to its current connection.
///
/// One entry per identity. Registering an identity that is already present
/// replaces the entry; the superseded connection is returned to the caller
/// and otherwise left alone.
#[derive(Debug, Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `identity`.
    ///
    /// Returns the previously registered connection when it was a different
    /// one.
    pub fn register(
        &self,
        identity: impl Into<String>,
        secret: impl Into<String>,
        connection: Arc<Connection>,
    ) -> Option<Arc<Connection>> {
        let new_id = connection.id();
        let previous = self.providers.write().insert(
            identity.into(),
            RegistryEntry {
                connection,
                secret: secret.into(),
            },
        );
        previous
            .map(|entry| entry.connection)
            .filter(|old| old.id() != new_id)
    }

    pub fn lookup(&self, identity: &str) -> Option<RegistryEntry> {
        self.providers.read().get(identity).cloned()
    }

    /// The provider connection for `identity`, if it exists and `secret`
    /// matches the one it registered with.
    pub fn authorize(&self, identity: &str, secret: &str) -> Option<Arc<Connection>> {
        self.providers
            .read()
            .get(identity)
            .filter(|entry| entry.secret == secret)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Remove `identity` only if it still points at `connection_id`.
    ///
    /// A provider that was superseded by a re-registration must not take the
    /// newer entry down with it when it closes.
    pub fn remove(&self, identity: &str, connection_id: ConnectionId) -> bool {
        let mut providers = self.providers.write();
        match providers.get(identity) {
            Some(entry) if entry.connection.id() == connection_id => {
                providers.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

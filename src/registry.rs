//! Registry of joined chat clients.
//!
//! Maps a connection handle to the identity the client declared during the
//! handshake. A connection is present from handshake completion until its
//! departure; looking it up outside that window is a lifecycle bug and is
//! reported as an error rather than papered over.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Handle of a live connection (its slot in the reactor's connection slab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a joined client is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Peer address observed at accept time.
    pub address: SocketAddr,
    /// Name announced in the handshake. Never changes afterwards.
    pub name: String,
}

impl Identity {
    /// `name@host`, the form used in every chat line and announcement.
    pub fn display_name(&self) -> String {
        format!("{}@{}", self.name, self.address.ip())
    }
}

/// Registry invariant violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ClientId),

    #[error("connection {0} is not registered")]
    UnknownConnection(ClientId),
}

/// Live mapping from connection handle to chat identity.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Identity>,
    /// Connected-client counter, used for join announcements.
    connected: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a client that completed its handshake.
    ///
    /// Returns the connected-client count including the new client.
    pub fn register(
        &mut self,
        id: ClientId,
        address: SocketAddr,
        name: impl Into<String>,
    ) -> Result<u64, RegistryError> {
        if self.clients.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        self.clients.insert(
            id,
            Identity {
                address,
                name: name.into(),
            },
        );
        self.connected += 1;
        Ok(self.connected)
    }

    /// Resolve `name@host` for a registered client.
    pub fn resolve_display_name(&self, id: ClientId) -> Result<String, RegistryError> {
        self.clients
            .get(&id)
            .map(Identity::display_name)
            .ok_or(RegistryError::UnknownConnection(id))
    }

    /// Remove a departed client.
    ///
    /// Strict: removing an absent handle is reported, not ignored.
    pub fn unregister(&mut self, id: ClientId) -> Result<Identity, RegistryError> {
        let identity = self
            .clients
            .remove(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        self.connected = self.connected.saturating_sub(1);
        Ok(identity)
    }

    #[cfg(test)]
    pub fn get(&self, id: ClientId) -> Option<&Identity> {
        self.clients.get(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Current value of the connected-client counter.
    pub fn connected(&self) -> u64 {
        self.connected
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Handles of every registered client, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], port))
    }

    #[test]
    fn test_register_counts_clients() {
        let mut registry = ClientRegistry::new();

        for i in 0..5 {
            let n = registry
                .register(ClientId(i), addr(i as u8, 4000), format!("user{i}"))
                .unwrap();
            assert_eq!(n, i as u64 + 1);
        }

        assert_eq!(registry.connected(), 5);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_duplicate_register() {
        let mut registry = ClientRegistry::new();
        registry.register(ClientId(1), addr(1, 1), "alice").unwrap();

        assert_eq!(
            registry.register(ClientId(1), addr(2, 2), "mallory"),
            Err(RegistryError::DuplicateConnection(ClientId(1)))
        );
        assert_eq!(registry.connected(), 1);
        assert_eq!(registry.get(ClientId(1)).unwrap().name, "alice");
    }

    #[test]
    fn test_display_name_uses_host_only() {
        let mut registry = ClientRegistry::new();
        registry
            .register(ClientId(7), addr(9, 51234), "alice")
            .unwrap();

        assert_eq!(
            registry.resolve_display_name(ClientId(7)).unwrap(),
            "alice@10.0.0.9"
        );
    }

    #[test]
    fn test_unknown_connection() {
        let mut registry = ClientRegistry::new();

        assert_eq!(
            registry.resolve_display_name(ClientId(3)),
            Err(RegistryError::UnknownConnection(ClientId(3)))
        );
        assert_eq!(
            registry.unregister(ClientId(3)),
            Err(RegistryError::UnknownConnection(ClientId(3)))
        );
    }

    #[test]
    fn test_unregister() {
        let mut registry = ClientRegistry::new();
        registry.register(ClientId(1), addr(1, 1), "alice").unwrap();
        registry.register(ClientId(2), addr(2, 2), "bob").unwrap();

        let gone = registry.unregister(ClientId(1)).unwrap();
        assert_eq!(gone.name, "alice");
        assert_eq!(registry.connected(), 1);
        assert!(!registry.contains(ClientId(1)));

        // Second removal is an invariant violation
        assert!(registry.unregister(ClientId(1)).is_err());
        assert_eq!(registry.connected(), 1);
    }
}

//! Registry of live clients keyed by identity
//!
//! Transports and timers only ever hold a [`ClientIdentity`]. Every event they
//! produce is resolved through this registry, so once a client is removed its
//! late events have nowhere to go and are dropped.

use crate::client::Client;
use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Opaque handle naming one client within a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientIdentity(u64);

impl ClientIdentity {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Thread-safe map of identity to live client
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientIdentity, Client>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh identity; identities are never reused
    pub fn next_identity(&self) -> ClientIdentity {
        ClientIdentity(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, identity: ClientIdentity, client: Client) -> EngineResult<()> {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if clients.contains_key(&identity) {
            return Err(EngineError::operation(format!(
                "{identity} is already registered"
            )));
        }
        clients.insert(identity, client);
        debug!(client = %identity, live = clients.len(), "client registered");
        Ok(())
    }

    pub fn lookup(&self, identity: ClientIdentity) -> Option<Client> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&identity)
            .cloned()
    }

    pub fn remove(&self, identity: ClientIdentity) -> Option<Client> {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = clients.remove(&identity);
        if removed.is_some() {
            debug!(client = %identity, live = clients.len(), "client removed");
        }
        removed
    }

    pub fn contains(&self, identity: ClientIdentity) -> bool {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&identity)
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identities of all live clients, ascending
    pub fn identities(&self) -> Vec<ClientIdentity> {
        let mut identities: Vec<_> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        identities.sort();
        identities
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.identities())
            .finish()
    }
}

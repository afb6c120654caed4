//! The peer arena.
//!
//! Peers are owned by the registry and looked up by identifier. The table is
//! read-mostly: lookups take the read lock, while connect and disconnect
//! paths take the write lock. No await point is ever held across a guard.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use brypt_types::{NodeIdentifier, RemoteAddress};

use crate::peer::PeerProxy;
use crate::sync::{read, write};

/// Identifier-keyed arena of peer proxies.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<NodeIdentifier, Arc<PeerProxy>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer by identifier.
    pub fn get(&self, identifier: &NodeIdentifier) -> Option<Arc<PeerProxy>> {
        read(&self.peers).get(identifier).cloned()
    }

    /// Fetch or create the proxy for an identifier.
    pub fn ensure(&self, identifier: NodeIdentifier) -> Arc<PeerProxy> {
        if let Some(peer) = self.get(&identifier) {
            return peer;
        }
        let mut peers = write(&self.peers);
        peers.entry(identifier).or_insert_with(|| PeerProxy::new(identifier)).clone()
    }

    /// Remove a proxy entirely, discarding its statistics.
    pub fn remove(&self, identifier: &NodeIdentifier) -> Option<Arc<PeerProxy>> {
        write(&self.peers).remove(identifier)
    }

    /// Every registered proxy.
    pub fn all(&self) -> Vec<Arc<PeerProxy>> {
        read(&self.peers).values().cloned().collect()
    }

    /// Proxies that are connected and authorized, the broadcast domain.
    pub fn authorized(&self) -> Vec<Arc<PeerProxy>> {
        read(&self.peers).values().filter(|peer| peer.is_authorized()).cloned().collect()
    }

    /// The peer registered at a given address, if any.
    pub fn find_by_address(&self, address: &RemoteAddress) -> Option<Arc<PeerProxy>> {
        read(&self.peers)
            .values()
            .find(|peer| peer.addresses().iter().any(|known| known == address))
            .cloned()
    }

    /// Number of registered proxies.
    pub fn len(&self) -> usize {
        read(&self.peers).len()
    }

    /// True when no proxies are registered.
    pub fn is_empty(&self) -> bool {
        read(&self.peers).is_empty()
    }
}

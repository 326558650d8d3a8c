//! User → client bookkeeping.
//!
//! The registry holds no lock of its own; [`UnifiedBridge`](crate::UnifiedBridge)
//! guards it with a single reader/writer lock and never performs I/O while
//! holding it.

use std::collections::{BTreeMap, HashMap};

use mangahub_core::ProtocolType;

use crate::client::ProtocolClient;

/// Per-user connection counts broken down by protocol.
pub type ProtocolStats = BTreeMap<String, BTreeMap<ProtocolType, usize>>;

/// Registered clients keyed by user, in registration order.
///
/// A user with no clients has no entry.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Vec<ProtocolClient>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a client to its user's list.
    pub fn register(&mut self, client: ProtocolClient) {
        self.clients
            .entry(client.user_id.clone())
            .or_default()
            .push(client);
    }

    /// Remove a client by ID. Unknown IDs are ignored.
    pub fn unregister(&mut self, client_id: &str, user_id: &str) -> Option<ProtocolClient> {
        let list = self.clients.get_mut(user_id)?;
        let pos = list.iter().position(|c| c.id.as_str() == client_id)?;
        let removed = list.remove(pos);
        if list.is_empty() {
            let _ = self.clients.remove(user_id);
        }
        Some(removed)
    }

    /// Clients of one user, cloned.
    pub fn clients_for(&self, user_id: &str) -> Vec<ProtocolClient> {
        self.clients.get(user_id).cloned().unwrap_or_default()
    }

    /// Look up a single client.
    pub fn find(&self, client_id: &str, user_id: &str) -> Option<&ProtocolClient> {
        self.clients
            .get(user_id)?
            .iter()
            .find(|c| c.id.as_str() == client_id)
    }

    /// Users with at least one client.
    pub fn active_user_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients across every user.
    pub fn total_connection_count(&self) -> usize {
        self.clients.values().map(Vec::len).sum()
    }

    /// Per-user, per-protocol counts.
    pub fn protocol_stats(&self) -> ProtocolStats {
        self.clients
            .iter()
            .map(|(user, list)| {
                let mut counts = BTreeMap::new();
                for client in list {
                    *counts.entry(client.protocol).or_insert(0) += 1;
                }
                (user.clone(), counts)
            })
            .collect()
    }
}

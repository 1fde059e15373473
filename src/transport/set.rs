//! The set of live normal connections.

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::id::NodeId;

use super::connection::Connection;

/// Outcome of offering a connection to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddConnectionResult {
    /// Inserted; this is now the one normal connection for its peer.
    Added,
    /// The connection is not in a normal state, or the set is full.
    InvalidConnection,
    /// A normal connection to this peer already exists.
    AlreadyExists,
}

/// Live connections indexed by peer node id.
///
/// Enforces the invariant that at most one normal connection (bootstrapping,
/// unvalidated, or permanent) exists per peer at any instant; the insert is
/// the atomic check-and-claim the rendezvous race relies on.
pub struct ConnectionSet {
    connections: HashMap<NodeId, Arc<Connection>>,
    capacity: usize,
}

impl ConnectionSet {
    /// Create a set capped at `capacity` normal connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: HashMap::new(),
            capacity,
        }
    }

    /// Offer a connection that has reached a normal state.
    pub fn insert(&mut self, connection: Arc<Connection>) -> AddConnectionResult {
        if !connection.state().is_normal() {
            return AddConnectionResult::InvalidConnection;
        }
        if self.connections.len() >= self.capacity {
            return AddConnectionResult::InvalidConnection;
        }
        let peer_id = connection.socket().peer_node_id();
        if self.connections.contains_key(&peer_id) {
            return AddConnectionResult::AlreadyExists;
        }
        self.connections.insert(peer_id, connection);
        AddConnectionResult::Added
    }

    /// Remove `connection` if it is the registered entry for its peer.
    ///
    /// Identity is checked so a late removal cannot evict a replacement
    /// connection to the same peer.
    pub fn remove(&mut self, connection: &Arc<Connection>) {
        let peer_id = connection.socket().peer_node_id();
        if let Some(existing) = self.connections.get(&peer_id) {
            if Arc::ptr_eq(existing, connection) {
                self.connections.remove(&peer_id);
            }
        }
    }

    /// Look up the connection to `peer_id`.
    pub fn find(&self, peer_id: NodeId) -> Option<Arc<Connection>> {
        self.connections.get(&peer_id).cloned()
    }

    /// Iterate over the live connections.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.values()
    }

    /// Number of normal connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

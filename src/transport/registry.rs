//! Socket id allocation and lookup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::core::endpoint;

use super::socket::Socket;

/// Maps per-transport socket ids (non-zero u32) to live sockets.
///
/// The registry stores non-owning handles; the owning edge goes through
/// `Connection -> Socket`. Linear scans by peer endpoint are fine at the
/// connection counts this layer sees (tens).
pub struct SocketRegistry {
    sockets: HashMap<u32, Weak<Socket>>,
}

impl SocketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
        }
    }

    /// Register a socket under a fresh random non-zero id and return the id.
    ///
    /// Collisions are resolved by regenerating; with a u32 id space and tens
    /// of sockets the loop all but never repeats.
    pub fn add(&mut self, socket: &Arc<Socket>) -> u32 {
        let mut id = 0u32;
        while id == 0 || self.sockets.contains_key(&id) {
            id = rand::random();
        }
        self.sockets.insert(id, Arc::downgrade(socket));
        id
    }

    /// Remove a registration. Id 0 and unknown ids are ignored.
    pub fn remove(&mut self, id: u32) {
        if id != 0 {
            self.sockets.remove(&id);
        }
    }

    /// Look up a live socket by id.
    pub fn find(&self, id: u32) -> Option<Arc<Socket>> {
        self.sockets.get(&id).and_then(Weak::upgrade)
    }

    /// Scan for the socket whose peer endpoint equals `endpoint`.
    pub fn find_by_peer_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<Socket>> {
        self.sockets
            .values()
            .filter_map(Weak::upgrade)
            .find(|socket| socket.peer_endpoint() == endpoint)
    }

    /// Scan for a symmetric-NAT revision candidate: same peer address as
    /// `sender`, a public peer endpoint, and a handshake not yet complete.
    pub fn find_revision_candidate(&self, sender: SocketAddr) -> Option<Arc<Socket>> {
        self.sockets.values().filter_map(Weak::upgrade).find(|socket| {
            let peer = socket.peer_endpoint();
            peer.ip() == sender.ip()
                && !endpoint::on_private_network(peer)
                && !socket.is_connected()
        })
    }

    /// Number of registered ids (live or not).
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether the registry holds no registrations.
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Inbound datagram steering.

use std::net::SocketAddr;
use std::sync::Weak;

use parking_lot::Mutex;

use super::manager::ConnectionManager;

/// Single entry point for every received datagram.
///
/// The dispatcher is deliberately thin: routing policy lives in
/// [`ConnectionManager::get_socket`]. The manager reference is weak and
/// swappable so teardown can detach it, turning late datagrams into no-ops.
pub struct Dispatcher {
    manager: Mutex<Weak<ConnectionManager>>,
}

impl Dispatcher {
    /// Create a dispatcher with no manager attached.
    pub fn new() -> Self {
        Self {
            manager: Mutex::new(Weak::new()),
        }
    }

    /// Attach the connection manager that handles routing.
    pub fn set_connection_manager(&self, manager: Weak<ConnectionManager>) {
        *self.manager.lock() = manager;
    }

    /// Detach the connection manager; subsequent datagrams are dropped.
    pub fn clear_connection_manager(&self) {
        *self.manager.lock() = Weak::new();
    }

    /// Route one datagram: deliver it to the socket it belongs to, or drop
    /// it with a diagnostic. Runs on the strand and never blocks on anything
    /// but the outgoing confirm send.
    pub async fn dispatch(&self, buffer: &[u8], sender: SocketAddr) {
        let manager = match self.manager.lock().upgrade() {
            Some(manager) => manager,
            None => return,
        };
        if let Some(socket) = manager.get_socket(buffer, sender) {
            socket.handle_frame(buffer, sender).await;
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

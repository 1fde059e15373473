//! Connection orchestration and unbound-handshake routing.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::core::config::TransportConfig;
use crate::core::endpoint;
use crate::core::id::{NodeId, PublicKey};

use super::connection::{ConnectResultHandler, Connection, MessageSentHandler};
use super::dispatcher::Dispatcher;
use super::frame::{self, ConnectionReason, HandshakePacket};
use super::multiplexer::Multiplexer;
use super::registry::SocketRegistry;
use super::set::{AddConnectionResult, ConnectionSet};
use super::socket::Socket;
use super::strand::Strand;
use super::transport::Transport;

/// Orchestrates connect, ping, close and send; routes handshake packets not
/// yet bound to a connection; owns the connection set and socket registry.
///
/// Every public operation is callable from any thread: the set and registry
/// sit behind short locks, and the heavy work is posted onto the strand. The
/// locks never wrap a call back into user code or a socket.
pub struct ConnectionManager {
    connections: Mutex<ConnectionSet>,
    sockets: Mutex<SocketRegistry>,
    transport: Weak<Transport>,
    strand: Strand,
    multiplexer: Arc<Multiplexer>,
    dispatcher: Arc<Dispatcher>,
    this_node_id: NodeId,
    this_public_key: PublicKey,
    config: TransportConfig,
}

impl ConnectionManager {
    /// Build a manager and attach it to the dispatcher.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Weak<Transport>,
        strand: Strand,
        multiplexer: Arc<Multiplexer>,
        dispatcher: Arc<Dispatcher>,
        this_node_id: NodeId,
        this_public_key: PublicKey,
        config: TransportConfig,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            connections: Mutex::new(ConnectionSet::new(config.max_connections)),
            sockets: Mutex::new(SocketRegistry::new()),
            transport,
            strand,
            multiplexer,
            dispatcher: Arc::clone(&dispatcher),
            this_node_id,
            this_public_key,
            config,
        });
        dispatcher.set_connection_manager(Arc::downgrade(&manager));
        manager
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.this_node_id
    }

    /// This node's public key.
    pub fn public_key(&self) -> PublicKey {
        self.this_public_key
    }

    /// Start an outgoing connection to `peer_id` at `peer_endpoint`.
    ///
    /// No effect if the owning transport has been dropped. `validation_data`
    /// is sent as the first message once the handshake completes; the
    /// lifespan decides the post-handshake state (see
    /// [`Connection::start_connecting`]).
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &self,
        peer_id: NodeId,
        peer_endpoint: SocketAddr,
        peer_public_key: PublicKey,
        validation_data: Vec<u8>,
        attempt_timeout: Duration,
        lifespan: Option<Duration>,
        on_result: Option<ConnectResultHandler>,
    ) {
        let Some(connection) = self.new_connection(peer_id, peer_endpoint, peer_public_key) else {
            return;
        };
        connection.start_connecting(validation_data, attempt_timeout, lifespan, on_result);
    }

    /// One-shot probe toward `peer_endpoint`: a `Temporary` connection whose
    /// handshake carries `reason`, reporting the outcome via `on_result`.
    pub fn ping(
        &self,
        peer_id: NodeId,
        peer_endpoint: SocketAddr,
        peer_public_key: PublicKey,
        reason: ConnectionReason,
        on_result: ConnectResultHandler,
    ) {
        let Some(connection) = self.new_connection(peer_id, peer_endpoint, peer_public_key) else {
            return;
        };
        connection.start_probing(reason, self.config.bootstrap_connect_timeout, on_result);
    }

    /// Create a pending connection with a registered socket, or `None` when
    /// the transport is gone or the multiplexer is closed.
    fn new_connection(
        &self,
        peer_id: NodeId,
        peer_endpoint: SocketAddr,
        peer_public_key: PublicKey,
    ) -> Option<Arc<Connection>> {
        let transport = self.transport.upgrade()?;
        let udp = self.multiplexer.socket()?;
        let this_endpoint = self
            .multiplexer
            .local_endpoint()
            .unwrap_or_else(endpoint::null_endpoint);
        let socket = Socket::new(udp, this_endpoint, peer_endpoint, peer_id, peer_public_key);
        self.add_socket(&socket);
        Some(Connection::new(
            Arc::downgrade(&transport),
            self.strand.clone(),
            socket,
        ))
    }

    /// Admit a connection that has reached a normal state.
    pub fn add_connection(&self, connection: &Arc<Connection>) -> AddConnectionResult {
        let result = self.connections.lock().insert(Arc::clone(connection));
        if result == AddConnectionResult::InvalidConnection {
            warn!(
                state = ?connection.state(),
                peer = %connection.socket().peer_node_id(),
                "connection refused by the set"
            );
        }
        result
    }

    /// Schedule a close on the connection to `peer_id`. Returns whether a
    /// connection was found; the set entry drains when the connection
    /// reports its closure.
    pub fn close_connection(&self, peer_id: NodeId) -> bool {
        let connection = { self.connections.lock().find(peer_id) };
        match connection {
            Some(connection) => {
                connection.close();
                true
            }
            None => {
                debug!(peer = %peer_id, "not currently connected");
                false
            }
        }
    }

    /// Remove a normal connection from the set.
    pub fn remove_connection(&self, connection: &Arc<Connection>) {
        debug_assert!(connection.state().is_normal());
        self.connections.lock().remove(connection);
    }

    /// Look up the connection to `peer_id`.
    pub fn get_connection(&self, peer_id: NodeId) -> Option<Arc<Connection>> {
        self.connections.lock().find(peer_id)
    }

    /// Queue `message` to `peer_id`. Returns `false` when not connected.
    pub fn send(
        &self,
        peer_id: NodeId,
        message: Vec<u8>,
        on_sent: Option<MessageSentHandler>,
    ) -> bool {
        let connection = { self.connections.lock().find(peer_id) };
        let Some(connection) = connection else {
            debug!(peer = %peer_id, "not currently connected");
            return false;
        };
        self.strand.post(async move {
            connection.start_sending(message, on_sent).await;
        });
        true
    }

    /// Promote the connection to `peer_id` to `Permanent`.
    ///
    /// Returns the peer's endpoint only when it is non-private, i.e. the
    /// peer is direct-connected.
    pub fn make_connection_permanent(
        &self,
        peer_id: NodeId,
        validated: bool,
    ) -> Result<Option<SocketAddr>, crate::core::error::TransportError> {
        let connection = { self.connections.lock().find(peer_id) };
        let Some(connection) = connection else {
            warn!(peer = %peer_id, "not currently connected");
            return Err(crate::core::error::TransportError::InvalidConnection);
        };
        connection.make_permanent(validated);
        let peer_endpoint = connection.socket().peer_endpoint();
        Ok((!endpoint::on_private_network(peer_endpoint)).then_some(peer_endpoint))
    }

    /// Our endpoint as used on the connection to `peer_id`.
    pub fn this_endpoint(&self, peer_id: NodeId) -> Option<SocketAddr> {
        self.connections
            .lock()
            .find(peer_id)
            .map(|connection| connection.socket().this_endpoint())
    }

    /// The NAT-detection endpoint `peer_id` advertised in its handshake.
    pub fn remote_nat_detection_endpoint(&self, peer_id: NodeId) -> Option<SocketAddr> {
        self.connections
            .lock()
            .find(peer_id)
            .map(|connection| connection.socket().remote_nat_detection_endpoint())
    }

    /// Pick another connected peer's endpoint to advertise for NAT
    /// detection, or the null endpoint when there is none to offer.
    pub fn nat_detection_endpoint_excluding(&self, peer_id: NodeId) -> SocketAddr {
        let connections = self.connections.lock();
        let result = connections
            .iter()
            .find(|connection| {
                connection.socket().peer_node_id() != peer_id
                    && connection.socket().is_connected()
            })
            .map(|connection| connection.socket().peer_endpoint())
            .unwrap_or_else(endpoint::null_endpoint);
        result
    }

    /// Number of normal connections.
    pub fn normal_connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Register a socket, assigning it a fresh id.
    pub fn add_socket(&self, socket: &Arc<Socket>) -> u32 {
        let id = self.sockets.lock().add(socket);
        socket.set_id(id);
        id
    }

    /// Deregister a socket id. Id 0 is ignored.
    pub fn remove_socket(&self, id: u32) {
        self.sockets.lock().remove(id);
    }

    /// Dispatcher helper: find the socket a datagram belongs to.
    ///
    /// Non-zero destination ids route through the registry. Id 0 means an
    /// unbound handshake: `Normal` handshakes match a pending socket by
    /// sender endpoint, falling back to symmetric-NAT endpoint revision;
    /// other reasons match by endpoint or divert into
    /// [`Self::handle_ping_from`].
    pub fn get_socket(&self, buffer: &[u8], sender: SocketAddr) -> Option<Arc<Socket>> {
        let socket_id = match frame::decode_destination_socket_id(buffer) {
            Ok(id) => id,
            Err(error) => {
                trace!(%error, %sender, "received a non-rudp packet");
                return None;
            }
        };

        if socket_id != 0 {
            let socket = self.sockets.lock().find(socket_id);
            if socket.is_none() {
                debug!(socket_id, %sender, "packet for an unknown connection");
            }
            return socket;
        }

        let packet = match HandshakePacket::decode(buffer) {
            Ok(packet) => packet,
            Err(error) => {
                trace!(%error, %sender, "failed to decode handshake packet");
                return None;
            }
        };

        if packet.reason == ConnectionReason::Normal {
            let sockets = self.sockets.lock();
            if let Some(socket) = sockets.find_by_peer_endpoint(sender) {
                return Some(socket);
            }
            // A connect attempt through a symmetric NAT can arrive from a
            // port other than the one this node was told to expect.
            if let Some(socket) = sockets.find_revision_candidate(sender) {
                debug!(
                    from = %socket.peer_endpoint(),
                    to = %sender,
                    "revising peer endpoint"
                );
                socket.update_peer_endpoint(sender);
                return Some(socket);
            }
            trace!(%sender, "unmatched normal handshake");
            return None;
        }

        let socket = { self.sockets.lock().find_by_peer_endpoint(sender) };
        match socket {
            // A handshake replying to this node's join or probe.
            Some(socket) => Some(socket),
            None => {
                self.handle_ping_from(&packet, sender);
                None
            }
        }
    }

    /// A handshake from a peer that is pinging this node or joining the
    /// network.
    pub fn handle_ping_from(&self, packet: &HandshakePacket, sender: SocketAddr) {
        if packet.node_id == self.this_node_id {
            warn!(id = %self.this_node_id, "handshaking with another local transport; dropping");
            return;
        }
        if !endpoint::is_valid(sender) {
            return;
        }

        if packet.reason == ConnectionReason::NatDetection {
            if let Some(transport) = self.transport.upgrade() {
                transport.nat_detection_requested(packet.node_id, sender);
            }
        }

        let bootstrap_and_drop = packet.reason == ConnectionReason::BootstrapAndDrop;
        let existing = if bootstrap_and_drop {
            None
        } else {
            self.connections.lock().find(packet.node_id)
        };
        if let Some(existing) = existing {
            warn!(
                peer = %packet.node_id,
                %sender,
                "bootstrap request from a currently connected peer; closing the connection"
            );
            existing.close();
            return;
        }

        let lifespan = if bootstrap_and_drop {
            Duration::ZERO
        } else {
            self.config.bootstrap_connection_lifespan
        };
        self.connect(
            packet.node_id,
            sender,
            packet.public_key,
            Vec::new(),
            self.config.bootstrap_connect_timeout,
            Some(lifespan),
            None,
        );
    }

    /// Detach from the dispatcher and schedule every connection's close.
    ///
    /// The set is not cleared here; entries drain as the connections report
    /// their closure.
    pub fn close(&self) {
        self.dispatcher.clear_connection_manager();
        let connections: Vec<_> = { self.connections.lock().iter().cloned().collect() };
        for connection in connections {
            connection.close();
        }
    }

    /// Multi-line rendering of the current connections.
    pub fn debug_string(&self) -> String {
        let connections = self.connections.lock();
        let mut out = String::new();
        for connection in connections.iter() {
            let _ = writeln!(
                out,
                "\t\tpeer {}  {:?}",
                connection.socket().peer_node_id(),
                connection.state()
            );
        }
        out
    }
}

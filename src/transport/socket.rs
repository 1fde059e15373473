//! Per-connection socket over the shared UDP socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::trace;

use crate::core::id::{NodeId, PublicKey};

use super::connection::Connection;
use super::frame::{Frame, HandshakePacket};

/// Mutable peer-side addressing and identity state.
#[derive(Debug, Clone)]
struct PeerState {
    endpoint: SocketAddr,
    node_id: NodeId,
    public_key: PublicKey,
    /// The peer's socket id, once its handshake has been seen.
    socket_id: u32,
    /// Original port before a symmetric-NAT endpoint revision.
    guessed_port: Option<u16>,
    /// NAT-detection endpoint the peer advertised in its handshake.
    nat_detection_endpoint: SocketAddr,
}

/// One end of a logical connection: identity, addressing, and framing over
/// the shared UDP socket.
///
/// Owned by exactly one [`Connection`]; registered in the socket registry
/// under a non-zero u32 id the moment it is created. The reliable-delivery
/// engine (congestion control, ACKs, retransmission of data) would live
/// behind this surface; here it carries handshakes and single-datagram
/// messages.
pub struct Socket {
    udp: Arc<UdpSocket>,
    this_endpoint: SocketAddr,
    id: AtomicU32,
    connected: AtomicBool,
    peer: Mutex<PeerState>,
    connection: Mutex<Weak<Connection>>,
}

impl Socket {
    /// Create a socket aimed at `peer_endpoint`.
    ///
    /// `peer_node_id` is the expected peer identity (zero when unknown); the
    /// handshake either confirms or fails it.
    pub fn new(
        udp: Arc<UdpSocket>,
        this_endpoint: SocketAddr,
        peer_endpoint: SocketAddr,
        peer_node_id: NodeId,
        peer_public_key: PublicKey,
    ) -> Arc<Self> {
        Arc::new(Self {
            udp,
            this_endpoint,
            id: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            peer: Mutex::new(PeerState {
                endpoint: peer_endpoint,
                node_id: peer_node_id,
                public_key: peer_public_key,
                socket_id: 0,
                guessed_port: None,
                nat_detection_endpoint: crate::core::endpoint::null_endpoint(),
            }),
            connection: Mutex::new(Weak::new()),
        })
    }

    /// Bind this socket to the connection that owns it.
    pub(crate) fn attach_connection(&self, connection: &Arc<Connection>) {
        *self.connection.lock() = Arc::downgrade(connection);
    }

    /// Record the registry id this socket was registered under.
    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// This socket's registry id (0 before registration).
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    /// The local endpoint the shared socket is bound to.
    pub fn this_endpoint(&self) -> SocketAddr {
        self.this_endpoint
    }

    /// Where the peer is currently addressed.
    pub fn peer_endpoint(&self) -> SocketAddr {
        self.peer.lock().endpoint
    }

    /// The peer's node id (expected until the handshake confirms it).
    pub fn peer_node_id(&self) -> NodeId {
        self.peer.lock().node_id
    }

    /// The peer's public key.
    pub fn peer_public_key(&self) -> PublicKey {
        self.peer.lock().public_key
    }

    /// The peer's socket id, learned from its handshake (0 until then).
    pub fn peer_socket_id(&self) -> u32 {
        self.peer.lock().socket_id
    }

    /// The port we originally guessed, kept when a symmetric-NAT revision
    /// replaced the peer endpoint.
    pub fn peer_guessed_port(&self) -> Option<u16> {
        self.peer.lock().guessed_port
    }

    /// NAT-detection endpoint the peer advertised (null when it had none).
    pub fn remote_nat_detection_endpoint(&self) -> SocketAddr {
        self.peer.lock().nat_detection_endpoint
    }

    /// Whether the handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Replace the peer endpoint after a symmetric-NAT port shift, keeping
    /// the original port as the guessed port.
    ///
    /// Only ever called on sockets whose peer endpoint is public and whose
    /// handshake has not completed; revising a connected socket would
    /// scramble a live session.
    pub fn update_peer_endpoint(&self, endpoint: SocketAddr) {
        let mut peer = self.peer.lock();
        peer.guessed_port = Some(peer.endpoint.port());
        peer.endpoint = endpoint;
    }

    /// Record the peer identity learned from its handshake and mark the
    /// socket connected.
    pub(crate) fn complete_handshake(&self, packet: &HandshakePacket) {
        {
            let mut peer = self.peer.lock();
            peer.node_id = packet.node_id;
            peer.public_key = packet.public_key;
            peer.socket_id = packet.source_socket_id;
            peer.nat_detection_endpoint = packet.nat_detection_endpoint;
        }
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Send a handshake toward the peer. `destination` is 0 until the peer's
    /// socket id is known.
    pub(crate) async fn send_handshake(
        &self,
        packet: &HandshakePacket,
        destination: u32,
    ) -> io::Result<()> {
        let target = self.peer_endpoint();
        self.udp.send_to(&packet.encode(destination), target).await?;
        Ok(())
    }

    /// Send message bytes as one data frame on a connected socket.
    pub(crate) async fn send_data(&self, payload: &[u8]) -> io::Result<()> {
        let (target, destination) = {
            let peer = self.peer.lock();
            (peer.endpoint, peer.socket_id)
        };
        self.udp
            .send_to(&Frame::encode_data(destination, payload), target)
            .await?;
        Ok(())
    }

    /// Tell the peer we are closing.
    pub(crate) async fn send_shutdown(&self) -> io::Result<()> {
        let (target, destination) = {
            let peer = self.peer.lock();
            (peer.endpoint, peer.socket_id)
        };
        self.udp
            .send_to(&Frame::encode_shutdown(destination), target)
            .await?;
        Ok(())
    }

    /// Handle one inbound frame already routed to this socket.
    ///
    /// Runs on the strand; forwards to the owning connection, which holds the
    /// state machine. A socket whose connection has gone away swallows the
    /// frame.
    pub(crate) async fn handle_frame(&self, buffer: &[u8], sender: SocketAddr) {
        let frame = match Frame::decode(buffer) {
            Ok(frame) => frame,
            Err(error) => {
                trace!(%error, %sender, "dropping undecodable frame");
                return;
            }
        };
        let connection = match self.connection.lock().upgrade() {
            Some(connection) => connection,
            None => return,
        };
        match frame {
            Frame::Handshake { destination, packet } => {
                connection.on_handshake(packet, destination == 0).await;
            }
            Frame::Data { payload, .. } => connection.on_data(payload),
            Frame::Shutdown { .. } => connection.on_peer_shutdown().await,
        }
    }
}

//! Connection lifecycle: handshake driving and the state machine.
//!
//! ```text
//!           create
//!             │
//!             ▼
//!         Pending ──handshake fail──▶ (destroyed)
//!             │
//!    handshake ok, by intent
//!     ┌───────┼──────────────┐
//!     ▼       ▼              ▼
//! Temporary Bootstrapping  Unvalidated ──validate──▶ Permanent
//!  (ping /                    │                          │
//!   bootstrap-and-drop)       │                          │
//!                             └── close / timeout / peer-drop ──▶ (removed)
//! ```
//!
//! `Duplicate` is a terminal label set by whichever side loses the
//! one-connection-per-peer race; such a connection is closed and never
//! announced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::core::error::TransportError;
use crate::core::id::NodeId;

use super::frame::{ConnectionReason, HandshakePacket};
use super::manager::ConnectionManager;
use super::socket::Socket;
use super::strand::Strand;
use super::transport::Transport;

/// Fallback handshake retransmission interval when the transport (and its
/// configuration) is already gone.
const FALLBACK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Completion handler for connect, ping, and send attempts.
pub type ConnectResultHandler = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Completion handler for a queued message.
pub type MessageSentHandler = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Pending,
    /// Bootstrap connection with a bounded lifespan.
    Bootstrapping,
    /// One-shot connection (ping or bootstrap-and-drop); never enters the set.
    Temporary,
    /// Handshake complete, peer validation still outstanding.
    Unvalidated,
    /// Validated, long-lived connection.
    Permanent,
    /// Lost the one-connection-per-peer race; closed silently.
    Duplicate,
}

impl ConnectionState {
    /// Normal states are the ones admitted to the connection set.
    pub fn is_normal(self) -> bool {
        matches!(self, Self::Bootstrapping | Self::Unvalidated | Self::Permanent)
    }
}

/// A logical connection to one peer, owning its [`Socket`].
///
/// All state transitions run as strand jobs. The back-reference to the
/// owning [`Transport`] is weak: once the transport is dropped, every posted
/// continuation becomes a no-op.
pub struct Connection {
    transport: Weak<Transport>,
    strand: Strand,
    socket: Arc<Socket>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    reason: Mutex<ConnectionReason>,
    lifespan: Mutex<Option<Duration>>,
    validation_data: Mutex<Vec<u8>>,
    on_result: Mutex<Option<ConnectResultHandler>>,
    validated: AtomicBool,
}

impl Connection {
    /// Create a connection around a freshly registered socket.
    pub fn new(transport: Weak<Transport>, strand: Strand, socket: Arc<Socket>) -> Arc<Self> {
        let connection = Arc::new(Self {
            transport,
            strand,
            socket,
            state: Mutex::new(ConnectionState::Pending),
            closed: AtomicBool::new(false),
            reason: Mutex::new(ConnectionReason::Normal),
            lifespan: Mutex::new(None),
            validation_data: Mutex::new(Vec::new()),
            on_result: Mutex::new(None),
            validated: AtomicBool::new(false),
        });
        connection.socket.attach_connection(&connection);
        connection
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// The socket this connection owns.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Whether validation was confirmed when the connection went permanent.
    pub fn is_validated(&self) -> bool {
        self.validated.load(Ordering::SeqCst)
    }

    /// Mark this connection the loser of a duplicate race.
    ///
    /// Must happen before `close` so the loss is never announced.
    pub fn mark_duplicate(&self) {
        *self.state.lock() = ConnectionState::Duplicate;
    }

    /// Promote to `Permanent`.
    pub fn make_permanent(&self, validated: bool) {
        *self.state.lock() = ConnectionState::Permanent;
        self.validated.store(validated, Ordering::SeqCst);
    }

    fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.transport.upgrade().and_then(|t| t.connection_manager())
    }

    /// Begin an outgoing connect: post the first handshake, arm retry and
    /// attempt-timeout timers.
    ///
    /// The lifespan decides intent: `None` is an unbounded rendezvous/direct
    /// connect, zero is bootstrap-and-drop, positive is a bootstrap join.
    pub fn start_connecting(
        self: &Arc<Self>,
        validation_data: Vec<u8>,
        attempt_timeout: Duration,
        lifespan: Option<Duration>,
        on_result: Option<ConnectResultHandler>,
    ) {
        let reason = match lifespan {
            None => ConnectionReason::Normal,
            Some(d) if d.is_zero() => ConnectionReason::BootstrapAndDrop,
            Some(_) => ConnectionReason::Bootstrap,
        };
        self.start_handshake(reason, validation_data, attempt_timeout, lifespan, on_result);
    }

    /// Begin a one-shot probe: `Ping` for reachability, `NatDetection` for a
    /// NAT probe.
    pub fn start_probing(
        self: &Arc<Self>,
        reason: ConnectionReason,
        attempt_timeout: Duration,
        on_result: ConnectResultHandler,
    ) {
        self.start_handshake(
            reason,
            Vec::new(),
            attempt_timeout,
            Some(Duration::ZERO),
            Some(on_result),
        );
    }

    fn start_handshake(
        self: &Arc<Self>,
        reason: ConnectionReason,
        validation_data: Vec<u8>,
        attempt_timeout: Duration,
        lifespan: Option<Duration>,
        on_result: Option<ConnectResultHandler>,
    ) {
        *self.reason.lock() = reason;
        *self.lifespan.lock() = lifespan;
        *self.validation_data.lock() = validation_data;
        *self.on_result.lock() = on_result;

        let this = Arc::clone(self);
        self.strand.post(async move {
            this.send_handshake(0).await;
        });
        self.arm_retry(attempt_timeout);
        self.arm_attempt_timeout(attempt_timeout);
    }

    async fn send_handshake(&self, destination: u32) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let packet = self.compose_handshake();
        if let Err(error) = self.socket.send_handshake(&packet, destination).await {
            trace!(%error, peer = %self.socket.peer_endpoint(), "handshake send failed");
        }
    }

    fn compose_handshake(&self) -> HandshakePacket {
        let peer_id = self.socket.peer_node_id();
        let (node_id, public_key, nat_detection_endpoint) = match self.manager() {
            Some(manager) => (
                manager.node_id(),
                manager.public_key(),
                manager.nat_detection_endpoint_excluding(peer_id),
            ),
            None => (
                NodeId::ZERO,
                crate::core::id::PublicKey::ZERO,
                crate::core::endpoint::null_endpoint(),
            ),
        };
        HandshakePacket {
            source_socket_id: self.socket.id(),
            node_id,
            public_key,
            reason: *self.reason.lock(),
            nat_detection_endpoint,
        }
    }

    /// Retransmit the handshake until connected, failed, or out of time.
    fn arm_retry(self: &Arc<Self>, attempt_timeout: Duration) {
        let interval = self
            .transport
            .upgrade()
            .map(|t| t.config().handshake_retry_interval)
            .unwrap_or(FALLBACK_RETRY_INTERVAL);
        let weak = Arc::downgrade(self);
        let strand = self.strand.clone();
        tokio::spawn(async move {
            let deadline = time::Instant::now() + attempt_timeout;
            loop {
                time::sleep(interval).await;
                if time::Instant::now() >= deadline {
                    break;
                }
                let connection = match weak.upgrade() {
                    Some(connection) => connection,
                    None => break,
                };
                if connection.state() != ConnectionState::Pending
                    || connection.closed.load(Ordering::SeqCst)
                {
                    break;
                }
                strand.post(async move {
                    connection.send_handshake(0).await;
                });
            }
        });
    }

    /// Fail the attempt if the handshake has not completed in time.
    ///
    /// This task holds the only guaranteed strong reference while the
    /// connection is pending, which bounds an unanswered connect's lifetime
    /// to its attempt timeout.
    fn arm_attempt_timeout(self: &Arc<Self>, attempt_timeout: Duration) {
        let connection = Arc::clone(self);
        let strand = self.strand.clone();
        tokio::spawn(async move {
            time::sleep(attempt_timeout).await;
            strand.post(async move {
                if connection.state() == ConnectionState::Pending {
                    debug!(peer = %connection.socket.peer_endpoint(), "connect attempt timed out");
                    connection.shutdown(Some(TransportError::TimedOut), true).await;
                }
            });
        });
    }

    /// Close this bootstrap connection when its lifespan runs out.
    fn arm_lifespan(self: &Arc<Self>, lifespan: Duration) {
        let weak = Arc::downgrade(self);
        let strand = self.strand.clone();
        tokio::spawn(async move {
            time::sleep(lifespan).await;
            let connection = match weak.upgrade() {
                Some(connection) => connection,
                None => return,
            };
            strand.post(async move {
                if connection.state() == ConnectionState::Bootstrapping {
                    debug!(
                        peer = %connection.socket.peer_node_id(),
                        "bootstrap connection lifespan expired"
                    );
                    connection.shutdown(None, true).await;
                }
            });
        });
    }

    /// Handle a handshake routed to our socket. `unbound` means it arrived
    /// with destination id 0, so the peer has not yet seen a handshake bound
    /// to its socket and needs a confirming one back.
    pub(crate) async fn on_handshake(self: &Arc<Self>, packet: HandshakePacket, unbound: bool) {
        if self.socket.is_connected() || self.closed.load(Ordering::SeqCst) {
            trace!(peer = %packet.node_id, "handshake on a settled socket ignored");
            return;
        }
        if self.state() != ConnectionState::Pending {
            return;
        }
        if !packet.node_id.is_valid() {
            trace!("handshake without a node id ignored");
            return;
        }
        let expected = self.socket.peer_node_id();
        if expected.is_valid() && expected != packet.node_id {
            warn!(%expected, got = %packet.node_id, "handshake from an unexpected peer");
            self.shutdown(Some(TransportError::FailedToConnect), true).await;
            return;
        }

        self.socket.complete_handshake(&packet);
        let state = match *self.reason.lock() {
            ConnectionReason::Normal => ConnectionState::Unvalidated,
            ConnectionReason::Bootstrap => ConnectionState::Bootstrapping,
            ConnectionReason::BootstrapAndDrop
            | ConnectionReason::NatDetection
            | ConnectionReason::Ping => ConnectionState::Temporary,
        };
        *self.state.lock() = state;

        if unbound {
            self.send_handshake(packet.source_socket_id).await;
        }

        if let Some(transport) = self.transport.upgrade() {
            transport.add_connection(self);
        }

        let handler = self.on_result.lock().take();
        if let Some(handler) = handler {
            handler(Ok(()));
        }

        let validation = std::mem::take(&mut *self.validation_data.lock());
        if !validation.is_empty() && self.state().is_normal() {
            if let Err(error) = self.socket.send_data(&validation).await {
                trace!(%error, "validation data send failed");
            }
        }

        match self.state() {
            ConnectionState::Temporary => {
                // Purpose served once the handshake is done.
                let this = Arc::clone(self);
                self.strand.post(async move {
                    this.shutdown(None, true).await;
                });
            }
            ConnectionState::Bootstrapping => {
                let lifespan = *self.lifespan.lock();
                if let Some(lifespan) = lifespan {
                    self.arm_lifespan(lifespan);
                }
            }
            _ => {}
        }
    }

    /// Deliver inbound message bytes upward.
    pub(crate) fn on_data(&self, payload: Vec<u8>) {
        if !self.state().is_normal() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.deliver_message(self.socket.peer_node_id(), payload);
        }
    }

    /// The peer asked us to close.
    pub(crate) async fn on_peer_shutdown(self: &Arc<Self>) {
        trace!(peer = %self.socket.peer_node_id(), "peer requested close");
        self.shutdown(None, false).await;
    }

    /// Send one message; report the outcome through `on_sent`.
    pub(crate) async fn start_sending(&self, message: Vec<u8>, on_sent: Option<MessageSentHandler>) {
        let result = self
            .socket
            .send_data(&message)
            .await
            .map_err(TransportError::from);
        if let Some(on_sent) = on_sent {
            on_sent(result);
        }
    }

    /// Post a close onto the strand.
    pub fn close(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.strand.post(async move {
            this.shutdown(None, true).await;
        });
    }

    /// Tear down: leave the set, deregister the socket, fire whatever the
    /// previous state owes. Idempotent.
    pub(crate) async fn shutdown(
        self: &Arc<Self>,
        error: Option<TransportError>,
        notify_peer: bool,
    ) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state();
        let timed_out = matches!(error, Some(TransportError::TimedOut));
        let transport = self.transport.upgrade();

        if state.is_normal() {
            if let Some(manager) = transport.as_ref().and_then(|t| t.connection_manager()) {
                manager.remove_connection(self);
            }
        }
        if let Some(manager) = transport.as_ref().and_then(|t| t.connection_manager()) {
            manager.remove_socket(self.socket.id());
        }

        // A duplicate loses silently; its peer may have kept the winning
        // connection and must not be told to close it.
        if notify_peer && self.socket.is_connected() && state != ConnectionState::Duplicate {
            if let Err(send_error) = self.socket.send_shutdown().await {
                trace!(error = %send_error, "shutdown frame send failed");
            }
        }

        if state == ConnectionState::Pending {
            // Never announced: report through the connect handler only.
            let handler = self.on_result.lock().take();
            if let Some(handler) = handler {
                handler(Err(error.unwrap_or(TransportError::FailedToConnect)));
            }
        } else if let Some(transport) = transport {
            transport.remove_connection(self, timed_out);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use tokio::net::UdpSocket;

    use crate::core::id::PublicKey;

    use super::*;

    fn peer_id(tag: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        NodeId::from_bytes(bytes)
    }

    async fn test_connection() -> Arc<Connection> {
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let this_endpoint = udp.local_addr().unwrap();
        let socket = Socket::new(
            udp,
            this_endpoint,
            "10.0.0.1:1000".parse().unwrap(),
            peer_id(1),
            PublicKey::ZERO,
        );
        Connection::new(Weak::new(), Strand::new(), socket)
    }

    #[test]
    fn test_normal_states() {
        assert!(ConnectionState::Bootstrapping.is_normal());
        assert!(ConnectionState::Unvalidated.is_normal());
        assert!(ConnectionState::Permanent.is_normal());

        assert!(!ConnectionState::Pending.is_normal());
        assert!(!ConnectionState::Temporary.is_normal());
        assert!(!ConnectionState::Duplicate.is_normal());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let connection = test_connection().await;
        assert_eq!(connection.state(), ConnectionState::Pending);

        connection.make_permanent(true);
        assert_eq!(connection.state(), ConnectionState::Permanent);
        assert!(connection.is_validated());

        connection.mark_duplicate();
        assert_eq!(connection.state(), ConnectionState::Duplicate);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let connection = test_connection().await;
        connection.shutdown(None, true).await;
        connection.shutdown(None, true).await;
        assert_eq!(connection.state(), ConnectionState::Pending);
    }

    #[tokio::test]
    async fn test_pending_failure_reports_through_handler() {
        let connection = test_connection().await;
        let (tx, rx) = tokio::sync::oneshot::channel();
        *connection.on_result.lock() = Some(Box::new(move |result| {
            let _ = tx.send(result);
        }));

        connection.shutdown(Some(TransportError::TimedOut), true).await;
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(TransportError::TimedOut)));
    }
}

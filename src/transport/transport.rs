//! Per-local-endpoint transport façade.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::core::config::TransportConfig;
use crate::core::endpoint::{self, Contact, EndpointPair, NatType};
use crate::core::error::TransportError;
use crate::core::id::{NodeId, PublicKey};

use super::connection::{ConnectResultHandler, Connection, ConnectionState, MessageSentHandler};
use super::dispatcher::Dispatcher;
use super::frame::ConnectionReason;
use super::manager::ConnectionManager;
use super::multiplexer::Multiplexer;
use super::set::AddConnectionResult;
use super::strand::Strand;

/// Application data arrived on a normal connection: `(peer, bytes)`.
pub type OnMessage = Arc<dyn Fn(NodeId, Vec<u8>) + Send + Sync + 'static>;

/// A connection was announced: `(peer, transport, temporary, connection)`.
pub type OnConnectionAdded =
    Arc<dyn Fn(NodeId, Arc<Transport>, bool, Arc<Connection>) + Send + Sync + 'static>;

/// A connection went away: `(peer, transport, temporary, timed_out)`.
pub type OnConnectionLost = Arc<dyn Fn(NodeId, Arc<Transport>, bool, bool) + Send + Sync + 'static>;

/// A peer asked this node to take part in NAT detection: `(peer, endpoint)`.
pub type OnNatDetectionRequested = Arc<dyn Fn(NodeId, SocketAddr) + Send + Sync + 'static>;

/// Event handlers installed by [`Transport::bootstrap`].
pub struct EventHandlers {
    /// Application data arrived on a normal connection.
    pub on_message: OnMessage,
    /// A connection was announced.
    pub on_connection_added: OnConnectionAdded,
    /// A connection went away.
    pub on_connection_lost: OnConnectionLost,
    /// A peer asked this node to take part in NAT detection.
    pub on_nat_detection_requested: OnNatDetectionRequested,
}

/// Callback slots, shared between the strand and the owning thread.
///
/// Guarded by their own lock, disjoint from the strand, so `close` can swap
/// them out from any thread.
#[derive(Default)]
struct CallbackSlots {
    on_message: Option<OnMessage>,
    on_connection_added: Option<OnConnectionAdded>,
    on_connection_lost: Option<OnConnectionLost>,
    on_nat_detection_requested: Option<OnNatDetectionRequested>,
}

/// One transport per local UDP endpoint.
///
/// Multiplexes every connection over one socket, drives bootstrap across
/// candidate peers, composes NAT detection, and owns the upward callbacks.
/// Created with [`Transport::new`] and inert until [`Transport::bootstrap`]
/// opens the multiplexer.
pub struct Transport {
    config: TransportConfig,
    strand: Strand,
    multiplexer: Arc<Multiplexer>,
    dispatcher: Arc<Dispatcher>,
    manager: Mutex<Option<Arc<ConnectionManager>>>,
    callbacks: Mutex<CallbackSlots>,
    nat_type: Mutex<NatType>,
    weak_self: Weak<Transport>,
}

impl Transport {
    /// Create a transport. Must be called from within a tokio runtime.
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            strand: Strand::new(),
            multiplexer: Arc::new(Multiplexer::new()),
            dispatcher: Arc::new(Dispatcher::new()),
            manager: Mutex::new(None),
            callbacks: Mutex::new(CallbackSlots::default()),
            nat_type: Mutex::new(NatType::Unknown),
            weak_self: weak_self.clone(),
        })
    }

    /// The tunables this transport runs with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The NAT type detected for the local network.
    pub fn nat_type(&self) -> NatType {
        *self.nat_type.lock()
    }

    /// This node's id (zero before bootstrap).
    pub fn node_id(&self) -> NodeId {
        self.connection_manager()
            .map(|manager| manager.node_id())
            .unwrap_or(NodeId::ZERO)
    }

    /// This node's public key (zero before bootstrap).
    pub fn public_key(&self) -> PublicKey {
        self.connection_manager()
            .map(|manager| manager.public_key())
            .unwrap_or(PublicKey::ZERO)
    }

    /// The local endpoint the multiplexer is bound to.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.multiplexer.local_endpoint()
    }

    pub(crate) fn connection_manager(&self) -> Option<Arc<ConnectionManager>> {
        self.manager.lock().clone()
    }

    /// Open the multiplexer on `local_endpoint`, install the handlers, and
    /// join the overlay through `candidates`.
    ///
    /// Candidates are tried in order; the first that yields a valid peer
    /// wins, NAT detection runs against it, and its contact is returned.
    /// `Ok(None)` means no outgoing attempt was wanted (bootstrapping off an
    /// existing connection behind a symmetric NAT); peers are expected to
    /// connect in. Candidates pointing at this transport's own endpoint are
    /// skipped.
    pub async fn bootstrap(
        &self,
        candidates: Vec<Contact>,
        this_node_id: NodeId,
        this_public_key: PublicKey,
        local_endpoint: SocketAddr,
        bootstrap_off_existing: bool,
        handlers: EventHandlers,
    ) -> Result<Option<Contact>, TransportError> {
        self.multiplexer.open(local_endpoint).await?;

        {
            let mut callbacks = self.callbacks.lock();
            callbacks.on_message = Some(handlers.on_message);
            callbacks.on_connection_added = Some(handlers.on_connection_added);
            callbacks.on_connection_lost = Some(handlers.on_connection_lost);
            callbacks.on_nat_detection_requested = Some(handlers.on_nat_detection_requested);
        }

        let manager = ConnectionManager::new(
            self.weak_self.clone(),
            self.strand.clone(),
            Arc::clone(&self.multiplexer),
            Arc::clone(&self.dispatcher),
            this_node_id,
            this_public_key,
            self.config.clone(),
        );
        *self.manager.lock() = Some(manager);

        self.multiplexer
            .start_dispatch(self.strand.clone(), Arc::clone(&self.dispatcher));

        self.try_bootstrapping(candidates, bootstrap_off_existing).await
    }

    async fn try_bootstrapping(
        &self,
        candidates: Vec<Contact>,
        bootstrap_off_existing: bool,
    ) -> Result<Option<Contact>, TransportError> {
        let lifespan = if bootstrap_off_existing {
            if self.nat_type() == NatType::Symmetric {
                // Nothing out there can be dialled through a symmetric NAT;
                // peers will connect in instead.
                info!(endpoint = ?self.local_endpoint(), "started transport without outgoing bootstrap");
                return Ok(None);
            }
            Duration::ZERO
        } else {
            self.config.bootstrap_connection_lifespan
        };

        let local = self.local_endpoint();
        for contact in candidates {
            if local == Some(contact.endpoint_pair.local)
                || local == Some(contact.endpoint_pair.external)
            {
                warn!(candidate = %contact.id, "skipping self-referential bootstrap candidate");
                continue;
            }
            match self.connect_to_bootstrap_endpoint(&contact, lifespan).await {
                Ok(()) => {
                    self.detect_nat_type(contact.id, contact.public_key).await;
                    return Ok(Some(contact));
                }
                Err(error) => {
                    debug!(candidate = %contact.id, %error, "bootstrap candidate failed");
                }
            }
        }
        Err(TransportError::NotConnectable)
    }

    /// One bootstrap attempt: connect to the candidate's external endpoint
    /// and wait for its handshake outcome.
    async fn connect_to_bootstrap_endpoint(
        &self,
        contact: &Contact,
        lifespan: Duration,
    ) -> Result<(), TransportError> {
        if !endpoint::is_valid(contact.endpoint_pair.external) {
            warn!(endpoint = %contact.endpoint_pair.external, "invalid bootstrap endpoint");
            return Err(TransportError::FailedToConnect);
        }
        let Some(manager) = self.connection_manager() else {
            return Err(TransportError::FailedToConnect);
        };

        let (tx, rx) = oneshot::channel();
        let handler: ConnectResultHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });
        manager.connect(
            contact.id,
            contact.endpoint_pair.external,
            contact.public_key,
            Vec::new(),
            self.config.bootstrap_connect_timeout,
            Some(lifespan),
            Some(handler),
        );
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::FailedToConnect),
        }
    }

    /// Probe the NAT-detection endpoint the winning bootstrap peer
    /// advertised; a failed probe marks this network symmetric.
    async fn detect_nat_type(&self, peer_id: NodeId, peer_public_key: PublicKey) {
        let Some(manager) = self.connection_manager() else {
            return;
        };
        let Some(nat_endpoint) = manager.remote_nat_detection_endpoint(peer_id) else {
            return;
        };
        if !endpoint::is_valid(nat_endpoint) {
            return;
        }

        let (tx, rx) = oneshot::channel();
        let handler: ConnectResultHandler = Box::new(move |result| {
            let _ = tx.send(result);
        });
        manager.ping(
            peer_id,
            nat_endpoint,
            peer_public_key,
            ConnectionReason::NatDetection,
            handler,
        );
        if !matches!(rx.await, Ok(Ok(()))) {
            debug!("nat detection probe failed; assuming a symmetric nat");
            *self.nat_type.lock() = NatType::Symmetric;
        }
    }

    /// Rendezvous connect toward both endpoints of `peer_endpoint_pair`.
    ///
    /// The external endpoint is tried first; when local differs, its attempt
    /// starts once the external outcome is known, and the two race for the
    /// connection slot through the duplicate guard. `on_connect` fires once,
    /// with the outcome of the last attempt started.
    pub fn connect(
        &self,
        peer_id: NodeId,
        peer_endpoint_pair: EndpointPair,
        peer_public_key: PublicKey,
        on_connect: ConnectResultHandler,
    ) {
        if !self.multiplexer.is_open() {
            on_connect(Err(TransportError::FailedToConnect));
            return;
        }
        let Some(manager) = self.connection_manager() else {
            on_connect(Err(TransportError::FailedToConnect));
            return;
        };

        let timeout = self.config.rendezvous_connect_timeout;
        if endpoint::is_valid(peer_endpoint_pair.external) {
            if peer_endpoint_pair.local != peer_endpoint_pair.external {
                let multiplexer = Arc::clone(&self.multiplexer);
                let chain_manager = Arc::clone(&manager);
                let local_endpoint = peer_endpoint_pair.local;
                let chained: ConnectResultHandler = Box::new(move |external_result| {
                    if !multiplexer.is_open() {
                        return on_connect(external_result);
                    }
                    chain_manager.connect(
                        peer_id,
                        local_endpoint,
                        peer_public_key,
                        Vec::new(),
                        timeout,
                        None,
                        Some(on_connect),
                    );
                });
                manager.connect(
                    peer_id,
                    peer_endpoint_pair.external,
                    peer_public_key,
                    Vec::new(),
                    timeout,
                    None,
                    Some(chained),
                );
            } else {
                manager.connect(
                    peer_id,
                    peer_endpoint_pair.external,
                    peer_public_key,
                    Vec::new(),
                    timeout,
                    None,
                    Some(on_connect),
                );
            }
        } else {
            manager.connect(
                peer_id,
                peer_endpoint_pair.local,
                peer_public_key,
                Vec::new(),
                timeout,
                None,
                Some(on_connect),
            );
        }
    }

    /// One-shot reachability ping toward `peer_endpoint`.
    pub fn ping(
        &self,
        peer_id: NodeId,
        peer_endpoint: SocketAddr,
        peer_public_key: PublicKey,
        on_result: ConnectResultHandler,
    ) {
        match self.connection_manager() {
            Some(manager) => manager.ping(
                peer_id,
                peer_endpoint,
                peer_public_key,
                ConnectionReason::Ping,
                on_result,
            ),
            None => on_result(Err(TransportError::FailedToConnect)),
        }
    }

    /// Send `message` to `peer_id`. Returns `false` when not connected.
    pub fn send(
        &self,
        peer_id: NodeId,
        message: Vec<u8>,
        on_sent: Option<MessageSentHandler>,
    ) -> bool {
        match self.connection_manager() {
            Some(manager) => manager.send(peer_id, message, on_sent),
            None => false,
        }
    }

    /// Schedule a close on the connection to `peer_id`.
    pub fn close_connection(&self, peer_id: NodeId) -> bool {
        match self.connection_manager() {
            Some(manager) => manager.close_connection(peer_id),
            None => false,
        }
    }

    /// Look up the connection to `peer_id`.
    pub fn get_connection(&self, peer_id: NodeId) -> Option<Arc<Connection>> {
        self.connection_manager()
            .and_then(|manager| manager.get_connection(peer_id))
    }

    /// Promote the connection to `peer_id` to `Permanent`; see
    /// [`ConnectionManager::make_connection_permanent`].
    pub fn make_connection_permanent(
        &self,
        peer_id: NodeId,
        validated: bool,
    ) -> Result<Option<SocketAddr>, TransportError> {
        self.connection_manager()
            .ok_or(TransportError::FailedToConnect)?
            .make_connection_permanent(peer_id, validated)
    }

    /// Number of normal connections.
    pub fn normal_connection_count(&self) -> usize {
        self.connection_manager()
            .map(|manager| manager.normal_connection_count())
            .unwrap_or(0)
    }

    /// Whether this transport has no normal connections.
    pub fn is_idle(&self) -> bool {
        self.normal_connection_count() == 0
    }

    /// Tear the transport down. Idempotent.
    ///
    /// Nulls the callback slots first so outstanding work announces nothing,
    /// then posts the manager's close and the multiplexer's close onto the
    /// strand behind any in-flight dispatch.
    pub fn close(&self) {
        {
            let mut callbacks = self.callbacks.lock();
            callbacks.on_message = None;
            callbacks.on_connection_added = None;
            callbacks.on_connection_lost = None;
            callbacks.on_nat_detection_requested = None;
        }

        let manager = self.connection_manager();
        let multiplexer = Arc::clone(&self.multiplexer);
        self.strand.post(async move {
            if let Some(manager) = manager {
                manager.close();
            }
            multiplexer.close();
        });
    }

    /// Admit a connection that completed its handshake.
    ///
    /// Temporary connections bypass the set and are only announced; a
    /// duplicate is labelled before it is closed so its loss stays silent.
    pub(crate) fn add_connection(&self, connection: &Arc<Connection>) {
        let state = connection.state();
        let temporary = state == ConnectionState::Temporary;
        if !temporary {
            let Some(manager) = self.connection_manager() else {
                return;
            };
            match manager.add_connection(connection) {
                AddConnectionResult::InvalidConnection => {
                    connection.close();
                    return;
                }
                AddConnectionResult::AlreadyExists => {
                    debug!(
                        peer = %connection.socket().peer_node_id(),
                        "duplicate connection; closing silently"
                    );
                    connection.mark_duplicate();
                    connection.close();
                    return;
                }
                AddConnectionResult::Added => {}
            }
        }

        info!(
            peer = %connection.socket().peer_node_id(),
            ?state,
            "connection added"
        );
        let callback = { self.callbacks.lock().on_connection_added.clone() };
        if let (Some(callback), Some(this)) = (callback, self.weak_self.upgrade()) {
            callback(
                connection.socket().peer_node_id(),
                this,
                temporary,
                Arc::clone(connection),
            );
        }
    }

    /// Announce a lost connection. Duplicates were never announced as added
    /// and stay silent here too.
    pub(crate) fn remove_connection(&self, connection: &Arc<Connection>, timed_out: bool) {
        let state = connection.state();
        if state == ConnectionState::Duplicate {
            return;
        }
        debug!(
            peer = %connection.socket().peer_node_id(),
            ?state,
            timed_out,
            "connection removed"
        );
        let callback = { self.callbacks.lock().on_connection_lost.clone() };
        if let (Some(callback), Some(this)) = (callback, self.weak_self.upgrade()) {
            callback(
                connection.socket().peer_node_id(),
                this,
                state == ConnectionState::Temporary,
                timed_out,
            );
        }
    }

    /// Deliver inbound message bytes to the owner.
    pub(crate) fn deliver_message(&self, peer_id: NodeId, message: Vec<u8>) {
        let callback = { self.callbacks.lock().on_message.clone() };
        if let Some(callback) = callback {
            callback(peer_id, message);
        }
    }

    /// A peer asked this node to take part in NAT detection.
    pub(crate) fn nat_detection_requested(&self, peer_id: NodeId, peer_endpoint: SocketAddr) {
        let callback = { self.callbacks.lock().on_nat_detection_requested.clone() };
        if let Some(callback) = callback {
            callback(peer_id, peer_endpoint);
        }
    }

    /// Short debug rendering of this transport's identity.
    pub fn this_debug_id(&self) -> String {
        match self.local_endpoint() {
            Some(endpoint) => format!("[{} - {}]", self.node_id(), endpoint),
            None => format!("[{} - closed]", self.node_id()),
        }
    }

    /// Multi-line listing of NAT type and connections.
    pub fn debug_string(&self) -> String {
        let mut out = format!("\t{}  {:?}\n", self.this_debug_id(), self.nat_type());
        if let Some(manager) = self.connection_manager() {
            out.push_str(&manager.debug_string());
        }
        out
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

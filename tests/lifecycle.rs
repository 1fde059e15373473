//! End-to-end connection lifecycle scenarios over loopback UDP.
//!
//! Each test runs real transports against each other on `127.0.0.1` and
//! observes the user-visible event stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use causeway::core::{
    Contact, EndpointPair, NatType, NodeId, PublicKey, TransportConfig, TransportConfigBuilder,
    TransportError,
};
use causeway::transport::{EventHandlers, Transport};
use causeway::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Added {
        peer: NodeId,
        temporary: bool,
    },
    Lost {
        peer: NodeId,
        temporary: bool,
        timed_out: bool,
    },
    Message {
        peer: NodeId,
        bytes: Vec<u8>,
    },
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn node_id(tag: u8) -> NodeId {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    NodeId::from_bytes(bytes)
}

fn test_config() -> TransportConfig {
    TransportConfigBuilder::new()
        .bootstrap_connect_timeout(Duration::from_secs(2))
        .rendezvous_connect_timeout(Duration::from_secs(2))
        .bootstrap_connection_lifespan(Duration::from_secs(60))
        .handshake_retry_interval(Duration::from_millis(100))
        .build()
}

fn handlers(tx: mpsc::UnboundedSender<Event>) -> EventHandlers {
    let added_tx = tx.clone();
    let lost_tx = tx.clone();
    EventHandlers {
        on_message: Arc::new(move |peer, bytes| {
            let _ = tx.send(Event::Message { peer, bytes });
        }),
        on_connection_added: Arc::new(move |peer, _transport, temporary, _connection| {
            let _ = added_tx.send(Event::Added { peer, temporary });
        }),
        on_connection_lost: Arc::new(move |peer, _transport, temporary, timed_out| {
            let _ = lost_tx.send(Event::Lost {
                peer,
                temporary,
                timed_out,
            });
        }),
        on_nat_detection_requested: Arc::new(|_, _| {}),
    }
}

/// A transport listening on loopback with no outgoing bootstrap.
async fn listening_node(
    tag: u8,
) -> (Arc<Transport>, NodeId, mpsc::UnboundedReceiver<Event>) {
    let transport = Transport::new(test_config());
    let (tx, rx) = mpsc::unbounded_channel();
    let id = node_id(tag);
    let result = transport
        .bootstrap(
            Vec::new(),
            id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(tx),
        )
        .await;
    assert!(matches!(result, Err(TransportError::NotConnectable)));
    (transport, id, rx)
}

fn contact_for(transport: &Transport, id: NodeId) -> Contact {
    Contact {
        id,
        endpoint_pair: EndpointPair::direct(transport.local_endpoint().unwrap()),
        public_key: PublicKey::ZERO,
    }
}

/// A bound but unresponsive loopback endpoint. Holding the socket keeps the
/// port from being reassigned while a test sends into the void.
fn dead_endpoint() -> (std::net::UdpSocket, SocketAddr) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_direct_bootstrap_success() {
    init_tracing();
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice = Transport::new(test_config());
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    let alice_id = node_id(1);
    let result = alice
        .bootstrap(
            vec![contact_for(&bob, bob_id)],
            alice_id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(alice_tx),
        )
        .await;

    let contact = result.unwrap().expect("expected a winning contact");
    assert_eq!(contact.id, bob_id);

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Added { peer, temporary: false } if peer == bob_id
    ));
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::Added { peer, temporary: false } if peer == alice_id
    ));

    assert_ne!(alice.nat_type(), NatType::Symmetric);
    assert_eq!(alice.normal_connection_count(), 1);
    assert_eq!(bob.normal_connection_count(), 1);
}

#[tokio::test]
async fn test_all_candidates_fail() {
    init_tracing();
    let config = TransportConfigBuilder::new()
        .bootstrap_connect_timeout(Duration::from_millis(300))
        .handshake_retry_interval(Duration::from_millis(100))
        .build();
    let transport = Transport::new(config);
    let (tx, mut events) = mpsc::unbounded_channel();

    let (_dead_socket, dead) = dead_endpoint();
    let candidate = Contact {
        id: node_id(9),
        endpoint_pair: EndpointPair::direct(dead),
        public_key: PublicKey::ZERO,
    };
    let result = transport
        .bootstrap(
            vec![candidate],
            node_id(1),
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(tx),
        )
        .await;

    assert!(matches!(result, Err(TransportError::NotConnectable)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert!(transport.is_idle());
}

#[tokio::test]
async fn test_duplicate_inbound_handshake_replaces_connection() {
    init_tracing();
    let (alice, _alice_id, mut alice_events) = listening_node(1).await;
    let bob_id = node_id(2);

    // First bootstrap from bob.
    let bob_one = Transport::new(test_config());
    let (bob_one_tx, _bob_one_events) = mpsc::unbounded_channel();
    bob_one
        .bootstrap(
            vec![contact_for(&alice, node_id(1))],
            bob_id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(bob_one_tx),
        )
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Added { peer, temporary: false } if peer == bob_id
    ));

    // The same node id re-bootstraps from a fresh endpoint. Alice closes the
    // stale connection on the first handshake and accepts the retry.
    let bob_two = Transport::new(test_config());
    let (bob_two_tx, _bob_two_events) = mpsc::unbounded_channel();
    bob_two
        .bootstrap(
            vec![contact_for(&alice, node_id(1))],
            bob_id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(bob_two_tx),
        )
        .await
        .unwrap();

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Lost { peer, temporary: false, .. } if peer == bob_id
    ));
    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Added { peer, temporary: false } if peer == bob_id
    ));
    assert_eq!(alice.normal_connection_count(), 1);
}

#[tokio::test]
async fn test_ping_only_makes_a_temporary_connection() {
    init_tracing();
    let (bob, bob_id, _bob_events) = listening_node(2).await;
    let (alice, _alice_id, mut alice_events) = listening_node(1).await;

    let (tx, rx) = oneshot::channel();
    alice.ping(
        bob_id,
        bob.local_endpoint().unwrap(),
        PublicKey::ZERO,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let result = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(result.is_ok());

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Added { peer, temporary: true } if peer == bob_id
    ));
    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Lost { peer, temporary: true, .. } if peer == bob_id
    ));
    assert_eq!(alice.normal_connection_count(), 0);
}

#[tokio::test]
async fn test_ping_unreachable_peer_fails() {
    init_tracing();
    let (alice, _alice_id, _alice_events) = listening_node(1).await;

    let (_dead_socket, dead) = dead_endpoint();
    let (tx, rx) = oneshot::channel();
    alice.ping(
        node_id(9),
        dead,
        PublicKey::ZERO,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let result = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert!(matches!(result, Err(TransportError::TimedOut)));
}

#[tokio::test]
async fn test_send_and_receive_messages() {
    init_tracing();
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice = Transport::new(test_config());
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    let alice_id = node_id(1);
    alice
        .bootstrap(
            vec![contact_for(&bob, bob_id)],
            alice_id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(alice_tx),
        )
        .await
        .unwrap();
    next_event(&mut alice_events).await;
    next_event(&mut bob_events).await;

    let (tx, rx) = oneshot::channel();
    assert!(alice.send(
        bob_id,
        b"hello over rudp".to_vec(),
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    ));
    assert!(timeout(Duration::from_secs(5), rx).await.unwrap().unwrap().is_ok());

    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::Message { peer, bytes } if peer == alice_id && bytes == b"hello over rudp"
    ));

    // Sends to unknown peers are refused.
    assert!(!alice.send(node_id(9), Vec::new(), None));
}

#[tokio::test]
async fn test_close_connection_announces_loss_on_both_sides() {
    init_tracing();
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice = Transport::new(test_config());
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    let alice_id = node_id(1);
    alice
        .bootstrap(
            vec![contact_for(&bob, bob_id)],
            alice_id,
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(alice_tx),
        )
        .await
        .unwrap();
    next_event(&mut alice_events).await;
    next_event(&mut bob_events).await;

    assert!(alice.close_connection(bob_id));

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Lost { peer, temporary: false, timed_out: false } if peer == bob_id
    ));
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::Lost { peer, temporary: false, timed_out: false } if peer == alice_id
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!alice.close_connection(bob_id));
    assert_eq!(alice.normal_connection_count(), 0);
}

#[tokio::test]
async fn test_make_connection_permanent() {
    init_tracing();
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice = Transport::new(test_config());
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    alice
        .bootstrap(
            vec![contact_for(&bob, bob_id)],
            node_id(1),
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(alice_tx),
        )
        .await
        .unwrap();
    next_event(&mut alice_events).await;
    next_event(&mut bob_events).await;

    // Loopback peers are on a private network, so no endpoint comes back.
    let endpoint = alice.make_connection_permanent(bob_id, true).unwrap();
    assert!(endpoint.is_none());
    let connection = alice.get_connection(bob_id).unwrap();
    assert_eq!(connection.state(), ConnectionState::Permanent);
    assert!(connection.is_validated());

    // Unknown peers are refused.
    assert!(alice.make_connection_permanent(node_id(9), true).is_err());
}

#[tokio::test]
async fn test_close_is_idempotent_and_drains_connections() {
    init_tracing();
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice = Transport::new(test_config());
    let (alice_tx, mut alice_events) = mpsc::unbounded_channel();
    alice
        .bootstrap(
            vec![contact_for(&bob, bob_id)],
            node_id(1),
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(alice_tx),
        )
        .await
        .unwrap();
    next_event(&mut alice_events).await;
    next_event(&mut bob_events).await;

    alice.close();
    alice.close();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.normal_connection_count(), 0);
    // The callbacks were nulled before the teardown ran: no loss event.
    assert!(alice_events.try_recv().is_err());
    // Bob's side was told to close and announces it.
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::Lost { temporary: false, .. }
    ));
}

#[tokio::test]
async fn test_close_during_pending_connect_stays_silent() {
    init_tracing();
    let config = TransportConfigBuilder::new()
        .rendezvous_connect_timeout(Duration::from_millis(300))
        .handshake_retry_interval(Duration::from_millis(100))
        .build();
    let transport = Transport::new(config);
    let (tx, mut events) = mpsc::unbounded_channel();
    let result = transport
        .bootstrap(
            Vec::new(),
            node_id(1),
            PublicKey::ZERO,
            "127.0.0.1:0".parse().unwrap(),
            false,
            handlers(tx),
        )
        .await;
    assert!(matches!(result, Err(TransportError::NotConnectable)));

    let (_dead_socket, dead) = dead_endpoint();
    let (connect_tx, connect_rx) = oneshot::channel();
    transport.connect(
        node_id(9),
        EndpointPair::direct(dead),
        PublicKey::ZERO,
        Box::new(move |result| {
            let _ = connect_tx.send(result);
        }),
    );
    transport.close();

    // The pending handshake resolves, but announces nothing.
    let result = timeout(Duration::from_secs(5), connect_rx).await.unwrap().unwrap();
    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_rendezvous_connect_between_two_nodes() {
    init_tracing();
    let (alice, alice_id, mut alice_events) = listening_node(1).await;
    let (bob, bob_id, mut bob_events) = listening_node(2).await;

    let alice_endpoint = alice.local_endpoint().unwrap();
    let bob_endpoint = bob.local_endpoint().unwrap();

    let (alice_tx, alice_rx) = oneshot::channel();
    alice.connect(
        bob_id,
        EndpointPair::direct(bob_endpoint),
        PublicKey::ZERO,
        Box::new(move |result| {
            let _ = alice_tx.send(result);
        }),
    );
    let (bob_tx, bob_rx) = oneshot::channel();
    bob.connect(
        alice_id,
        EndpointPair::direct(alice_endpoint),
        PublicKey::ZERO,
        Box::new(move |result| {
            let _ = bob_tx.send(result);
        }),
    );

    assert!(timeout(Duration::from_secs(5), alice_rx).await.unwrap().unwrap().is_ok());
    assert!(timeout(Duration::from_secs(5), bob_rx).await.unwrap().unwrap().is_ok());

    assert!(matches!(
        next_event(&mut alice_events).await,
        Event::Added { peer, temporary: false } if peer == bob_id
    ));
    assert!(matches!(
        next_event(&mut bob_events).await,
        Event::Added { peer, temporary: false } if peer == alice_id
    ));
    assert_eq!(alice.normal_connection_count(), 1);
    assert_eq!(bob.normal_connection_count(), 1);
}

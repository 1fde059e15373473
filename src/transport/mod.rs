//! Connection lifecycle and dispatch core.
//!
//! This module multiplexes one UDP socket across many logical connections:
//!
//! - **Frame codec**: [`Frame`], [`HandshakePacket`] and the destination-id
//!   header every datagram starts with
//! - **Dispatch**: [`Dispatcher`] steers each inbound datagram to its
//!   [`Socket`] or to the unbound-handshake path
//! - **Bookkeeping**: [`SocketRegistry`] (socket ids) and [`ConnectionSet`]
//!   (one normal connection per peer)
//! - **Orchestration**: [`ConnectionManager`] (connect / ping / send / close,
//!   symmetric-NAT endpoint revision, bootstrap answers)
//! - **Façade**: [`Transport`] (callbacks, bootstrap, NAT detection, teardown)
//! - **Serialisation**: [`Strand`], the per-transport executor
//!
//! # Control flow
//!
//! ```text
//! Multiplexer ──▶ Dispatcher::dispatch ──▶ ConnectionManager::get_socket
//!                                             │                │
//!                                   bound socket        unbound handshake
//!                                             │                │
//!                                    Socket::handle_frame   handle_ping_from
//! ```

mod connection;
mod dispatcher;
mod frame;
mod manager;
mod multiplexer;
mod registry;
mod set;
mod socket;
mod strand;
#[allow(clippy::module_inception)]
mod transport;

pub use connection::{ConnectResultHandler, Connection, ConnectionState, MessageSentHandler};
pub use dispatcher::Dispatcher;
pub use frame::{sizes, ConnectionReason, Frame, FrameKind, HandshakePacket};
pub use manager::ConnectionManager;
pub use multiplexer::{Multiplexer, MAX_DATAGRAM_SIZE};
pub use registry::SocketRegistry;
pub use set::{AddConnectionResult, ConnectionSet};
pub use socket::Socket;
pub use strand::Strand;
pub use transport::{
    EventHandlers, OnConnectionAdded, OnConnectionLost, OnMessage, OnNatDetectionRequested,
    Transport,
};

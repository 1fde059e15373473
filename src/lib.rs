//! # Causeway
//!
//! Causeway is the connection lifecycle and dispatch core of a reliable-UDP
//! transport. It multiplexes a single UDP socket across many logical
//! connections to named peers, steers each inbound datagram to the right
//! connection, mediates connection establishment (bootstrap and NAT-traversal
//! variants), and drives per-connection state transitions with duplicate
//! detection.
//!
//! The congestion-controlled reliable-delivery engine sits *below* this layer
//! behind the [`transport::Socket`] surface; application-level message framing
//! sits *above* a completed connection.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Application framing                │
//! ├─────────────────────────────────────────────┤
//! │  Transport / ConnectionManager / Dispatcher │  ← this crate
//! ├─────────────────────────────────────────────┤
//! │     Reliable-delivery engine (Socket)       │
//! ├─────────────────────────────────────────────┤
//! │                   UDP                       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Each [`transport::Transport`] serialises its connection-state mutations and
//! I/O completions on a [`transport::Strand`]: a single task draining posted
//! jobs in order. Operations callable from foreign threads guard the
//! connection set with a short lock, drop it, and post the heavy work onto the
//! strand. Callbacks back into the owner always observe a single total order
//! per transport.
//!
//! # Modules
//!
//! - [`core`]: node ids, endpoint predicates, configuration, and error types
//! - [`transport`]: the dispatch core and connection lifecycle

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod core;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        Contact, EndpointPair, NatType, NodeId, PublicKey, TransportConfig, TransportError,
    };
    pub use crate::transport::{Connection, ConnectionState, EventHandlers, Transport};
}

// Re-export commonly used items at crate root.
pub use crate::core::{
    Contact, EndpointPair, NatType, NodeId, PublicKey, TransportConfig, TransportError,
};
pub use crate::transport::{Connection, ConnectionState, Transport};

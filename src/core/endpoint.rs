//! Endpoint predicates and addressing types.
//!
//! Connects carry an [`EndpointPair`] because a peer behind NAT is reachable
//! at different addresses from inside and outside its network; bootstrap
//! candidates are full [`Contact`]s.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::core::id::{NodeId, PublicKey};

/// The unroutable sentinel endpoint (`0.0.0.0:0`).
pub fn null_endpoint() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Returns `true` when `endpoint` can actually be sent to: a real port and a
/// specified address.
pub fn is_valid(endpoint: SocketAddr) -> bool {
    endpoint.port() != 0 && !endpoint.ip().is_unspecified()
}

/// Returns `true` for addresses that are not publicly routable: RFC 1918
/// ranges, loopback, link-local, and IPv6 unique-local.
pub fn on_private_network(endpoint: SocketAddr) -> bool {
    match endpoint.ip() {
        IpAddr::V4(ip) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.is_unique_local() || ip.is_unicast_link_local(),
    }
}

/// A peer's local and external endpoints, as used during rendezvous connect.
///
/// The two differ when the peer sits behind NAT; for a directly reachable
/// peer they are the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPair {
    /// Endpoint on the peer's own network.
    pub local: SocketAddr,
    /// Endpoint as seen from outside the peer's network.
    pub external: SocketAddr,
}

impl EndpointPair {
    /// Create a pair from distinct local and external endpoints.
    pub fn new(local: SocketAddr, external: SocketAddr) -> Self {
        Self { local, external }
    }

    /// A directly reachable peer: local and external are the same address.
    pub fn direct(endpoint: SocketAddr) -> Self {
        Self {
            local: endpoint,
            external: endpoint,
        }
    }
}

/// Everything needed to attempt a connection to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    /// The peer's node id.
    pub id: NodeId,
    /// Where the peer can be reached.
    pub endpoint_pair: EndpointPair,
    /// The peer's public key, carried opaquely.
    pub public_key: PublicKey,
}

/// NAT classification of this transport's local network.
///
/// `Symmetric` is detected by a failed remote probe and forces inbound-only
/// bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    /// Not yet probed.
    #[default]
    Unknown,
    /// Port-preserving NAT (or none); outgoing connects work.
    Cone,
    /// External port depends on destination; peers must connect in.
    Symmetric,
}

//! Wire frames for the dispatch layer.
//!
//! Every datagram begins with a 4-byte big-endian destination socket id and a
//! 1-byte frame kind. Destination id 0 designates a handshake that is not yet
//! bound to a socket; a non-zero id routes to a registered socket.
//!
//! ```text
//! +---------------------------+--------+----------------------+
//! | Destination socket id     | Kind   | Body                 |
//! | 4 bytes (BE32)            | 1 byte | kind-dependent       |
//! +---------------------------+--------+----------------------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::endpoint;
use crate::core::error::DecodeError;
use crate::core::id::{NodeId, PublicKey, NODE_ID_SIZE, PUBLIC_KEY_SIZE};

/// Size constants for the wire format.
pub mod sizes {
    use crate::core::id::{NODE_ID_SIZE, PUBLIC_KEY_SIZE};

    /// Destination socket id + frame kind.
    pub const HEADER_SIZE: usize = 4 + 1;
    /// Encoded socket address: version tag + 16 address bytes + port.
    pub const ENDPOINT_SIZE: usize = 1 + 16 + 2;
    /// Full handshake frame: header + source id + node id + public key +
    /// reason + NAT-detection endpoint.
    pub const HANDSHAKE_SIZE: usize =
        HEADER_SIZE + 4 + NODE_ID_SIZE + PUBLIC_KEY_SIZE + 1 + ENDPOINT_SIZE;
}

/// Frame kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Handshake (initial, answering, or confirming).
    Handshake = 0x01,
    /// Opaque message payload for a bound socket.
    Data = 0x02,
    /// Peer-requested close.
    Shutdown = 0x03,
}

impl FrameKind {
    /// Parse a frame kind from its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Handshake),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Shutdown),
            _ => None,
        }
    }

    /// Wire byte for this kind.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Why a peer is opening a connection; carried in every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionReason {
    /// Rendezvous or direct connect between coordinated peers.
    Normal = 0,
    /// Bootstrap join that keeps its connection for the bootstrap lifespan.
    Bootstrap = 1,
    /// Bootstrap that is dropped as soon as the handshake completes.
    BootstrapAndDrop = 2,
    /// NAT-detection probe.
    NatDetection = 3,
    /// Reachability ping.
    Ping = 4,
}

impl ConnectionReason {
    /// Parse a reason from its wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        match byte {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Bootstrap),
            2 => Ok(Self::BootstrapAndDrop),
            3 => Ok(Self::NatDetection),
            4 => Ok(Self::Ping),
            other => Err(DecodeError::UnknownReason(other)),
        }
    }

    /// Wire byte for this reason.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Extract the destination socket id every frame starts with.
pub fn decode_destination_socket_id(buffer: &[u8]) -> Result<u32, DecodeError> {
    if buffer.len() < sizes::HEADER_SIZE {
        return Err(DecodeError::TooShort {
            expected: sizes::HEADER_SIZE,
            actual: buffer.len(),
        });
    }
    Ok(u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]))
}

/// The handshake body exchanged while binding two sockets together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacket {
    /// Socket id the sender allocated for this connection.
    pub source_socket_id: u32,
    /// The sender's node id.
    pub node_id: NodeId,
    /// The sender's public key, carried opaquely.
    pub public_key: PublicKey,
    /// Why the sender is connecting.
    pub reason: ConnectionReason,
    /// Endpoint of a third party able to probe the receiver, or the null
    /// endpoint when the sender has none to offer.
    pub nat_detection_endpoint: SocketAddr,
}

impl HandshakePacket {
    /// Encode as a full frame with the given destination id (0 = unbound).
    pub fn encode(&self, destination: u32) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(sizes::HANDSHAKE_SIZE);
        buffer.extend_from_slice(&destination.to_be_bytes());
        buffer.push(FrameKind::Handshake.as_byte());
        buffer.extend_from_slice(&self.source_socket_id.to_be_bytes());
        buffer.extend_from_slice(self.node_id.as_bytes());
        buffer.extend_from_slice(self.public_key.as_bytes());
        buffer.push(self.reason.as_byte());
        buffer.extend_from_slice(&encode_endpoint(self.nat_detection_endpoint));
        buffer
    }

    /// Decode a full handshake frame (header included).
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < sizes::HANDSHAKE_SIZE {
            return Err(DecodeError::TooShort {
                expected: sizes::HANDSHAKE_SIZE,
                actual: buffer.len(),
            });
        }
        match FrameKind::from_byte(buffer[4]) {
            Some(FrameKind::Handshake) => {}
            _ => return Err(DecodeError::UnknownKind(buffer[4])),
        }

        let mut offset = sizes::HEADER_SIZE;
        let source_socket_id = u32::from_be_bytes([
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ]);
        offset += 4;

        let mut node_id = [0u8; NODE_ID_SIZE];
        node_id.copy_from_slice(&buffer[offset..offset + NODE_ID_SIZE]);
        offset += NODE_ID_SIZE;

        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        public_key.copy_from_slice(&buffer[offset..offset + PUBLIC_KEY_SIZE]);
        offset += PUBLIC_KEY_SIZE;

        let reason = ConnectionReason::from_byte(buffer[offset])?;
        offset += 1;

        let nat_detection_endpoint = decode_endpoint(&buffer[offset..offset + sizes::ENDPOINT_SIZE]);

        Ok(Self {
            source_socket_id,
            node_id: NodeId::from_bytes(node_id),
            public_key: PublicKey::from_bytes(public_key),
            reason,
            nat_detection_endpoint,
        })
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Handshake, with the destination id it arrived under (0 = unbound).
    Handshake {
        /// Destination socket id from the header.
        destination: u32,
        /// Decoded handshake body.
        packet: HandshakePacket,
    },
    /// Message bytes for a bound socket.
    Data {
        /// Destination socket id from the header.
        destination: u32,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// Peer-requested close.
    Shutdown {
        /// Destination socket id from the header.
        destination: u32,
    },
}

impl Frame {
    /// Decode any frame from a raw datagram.
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        let destination = decode_destination_socket_id(buffer)?;
        let kind = FrameKind::from_byte(buffer[4]).ok_or(DecodeError::UnknownKind(buffer[4]))?;
        match kind {
            FrameKind::Handshake => Ok(Self::Handshake {
                destination,
                packet: HandshakePacket::decode(buffer)?,
            }),
            FrameKind::Data => Ok(Self::Data {
                destination,
                payload: buffer[sizes::HEADER_SIZE..].to_vec(),
            }),
            FrameKind::Shutdown => Ok(Self::Shutdown { destination }),
        }
    }

    /// Encode a data frame for the given destination socket.
    pub fn encode_data(destination: u32, payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(sizes::HEADER_SIZE + payload.len());
        buffer.extend_from_slice(&destination.to_be_bytes());
        buffer.push(FrameKind::Data.as_byte());
        buffer.extend_from_slice(payload);
        buffer
    }

    /// Encode a shutdown frame for the given destination socket.
    pub fn encode_shutdown(destination: u32) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(sizes::HEADER_SIZE);
        buffer.extend_from_slice(&destination.to_be_bytes());
        buffer.push(FrameKind::Shutdown.as_byte());
        buffer
    }
}

/// Encode a socket address: tag (0 = none, 4 = v4, 6 = v6), 16 address bytes,
/// big-endian port. Invalid endpoints encode as all zeros.
fn encode_endpoint(endpoint: SocketAddr) -> [u8; sizes::ENDPOINT_SIZE] {
    let mut buffer = [0u8; sizes::ENDPOINT_SIZE];
    if !endpoint::is_valid(endpoint) {
        return buffer;
    }
    match endpoint.ip() {
        IpAddr::V4(ip) => {
            buffer[0] = 4;
            buffer[1..5].copy_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buffer[0] = 6;
            buffer[1..17].copy_from_slice(&ip.octets());
        }
    }
    buffer[17..19].copy_from_slice(&endpoint.port().to_be_bytes());
    buffer
}

/// Decode a socket address; unknown tags yield the null endpoint.
fn decode_endpoint(buffer: &[u8]) -> SocketAddr {
    let port = u16::from_be_bytes([buffer[17], buffer[18]]);
    match buffer[0] {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buffer[1..5]);
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)
        }
        6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buffer[1..17]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
        _ => endpoint::null_endpoint(),
    }
}

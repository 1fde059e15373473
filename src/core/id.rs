//! Node identity types.
//!
//! A [`NodeId`] names a peer independently of its network location; a
//! [`PublicKey`] is carried opaquely through the handshake. Neither type
//! implies any cryptographic policy at this layer.

use std::fmt;

/// Size of a node identifier in bytes.
pub const NODE_ID_SIZE: usize = 32;

/// Size of a peer public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Opaque fixed-width node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// The all-zero sentinel; never valid on the wire.
    pub const ZERO: Self = Self([0u8; NODE_ID_SIZE]);

    /// Create a node id from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// A valid id is anything other than the all-zero sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::ZERO
    }
}

impl fmt::Display for NodeId {
    /// Short debug form: the first 7 hex characters.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut short = String::with_capacity(8);
        for byte in &self.0[..4] {
            short.push_str(&format!("{byte:02x}"));
        }
        short.truncate(7);
        f.write_str(&short)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

/// Peer-supplied public key, carried opaquely through the handshake.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// The all-zero placeholder key.
    pub const ZERO: Self = Self([0u8; PUBLIC_KEY_SIZE]);

    /// Create a public key from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex_preview(&self.0))
    }
}

/// First four bytes as hex, with an ellipsis for longer input.
fn hex_preview(bytes: &[u8]) -> String {
    if bytes.len() <= 4 {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        format!(
            "{}...",
            bytes[..4].iter().map(|b| format!("{b:02x}")).collect::<String>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_validity() {
        assert!(!NodeId::ZERO.is_valid());

        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[31] = 1;
        assert!(NodeId::from_bytes(bytes).is_valid());
    }

    #[test]
    fn test_node_id_short_display() {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = 0xab;
        bytes[1] = 0xcd;
        bytes[2] = 0xef;
        bytes[3] = 0x12;
        let display = format!("{}", NodeId::from_bytes(bytes));
        assert_eq!(display, "abcdef1");
        assert_eq!(display.len(), 7);
    }

    #[test]
    fn test_public_key_debug_preview() {
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        bytes[0] = 0x01;
        let debug = format!("{:?}", PublicKey::from_bytes(bytes));
        assert_eq!(debug, "PublicKey(01000000...)");
    }
}

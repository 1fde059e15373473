//! Error types for the transport core.

use thiserror::Error;

/// Errors surfaced by transport operations.
///
/// Decoding and routing failures are never surfaced through this type; they
/// are logged and the offending datagram is dropped.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No bootstrap candidate yielded a connection.
    #[error("no bootstrap candidate was connectable")]
    NotConnectable,

    /// The connection is not in a state that permits the operation.
    #[error("invalid connection")]
    InvalidConnection,

    /// A normal connection to this peer already exists.
    #[error("a connection to this peer already exists")]
    ConnectionAlreadyExists,

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The connect attempt failed outright, or the transport is closed.
    #[error("failed to connect")]
    FailedToConnect,

    /// I/O error from the underlying UDP socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this error is a connect-attempt timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Errors from decoding wire frames.
///
/// These are logged and dropped by the dispatch path, never surfaced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer too small for the expected structure.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length the structure requires.
        expected: usize,
        /// Length actually received.
        actual: usize,
    },

    /// Unknown frame kind byte.
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Unknown connection reason byte.
    #[error("unknown connection reason: {0}")]
    UnknownReason(u8),
}

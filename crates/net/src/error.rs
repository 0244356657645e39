//! Error taxonomy for the wire protocol.

use crate::protocol::Opcode;
use thiserror::Error;

/// An outgoing message violates a wire constraint. Nothing is written.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct EncodeError {
    /// Offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub reason: &'static str,
}

impl EncodeError {
    pub(crate) const fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Outcome of reading past the bytes that are available, or of reading bytes
/// that break a kind's invariants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes yet; retry once more arrive.
    #[error("frame incomplete")]
    Incomplete,
    /// Bytes present but invalid.
    #[error("malformed {field}: {reason}")]
    Malformed {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl DecodeError {
    pub(crate) const fn malformed(field: &'static str, reason: &'static str) -> Self {
        Self::Malformed { field, reason }
    }
}

/// Failures that end a single connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// First byte of a frame maps to no message kind.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    /// Frame bytes violate the kind's layout.
    #[error("malformed {opcode:?} frame: {field}: {reason}")]
    Malformed {
        /// Kind being parsed.
        opcode: Opcode,
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Well-formed message that is not allowed in the connection's state.
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    /// Login rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),
    /// Peer keeps sending bytes that never form a message.
    #[error("receive buffer exceeded {limit} bytes")]
    InboundOverflow {
        /// Configured cap.
        limit: usize,
    },
    /// Outgoing message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Socket failure.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

//! Error types for the protocol layer.
//!
//! Each crate in speedwire defines its own error enum. A `ProtocolError`
//! always means the bytes (or the value about to become bytes) did not
//! fit the wire format or the descriptor table, never that the network
//! or the session misbehaved on its own.

use speedwire_transport::TransportError;

/// Errors that can occur while encoding or decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying stream failed or ended mid-value.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A value could not be written in the requested representation.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes on the wire could not be turned back into a value.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A value's shape does not match the codec it is written with.
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The top two prefix bits name no segment kind for this peer role.
    #[error("invalid segment kind {kind} for {role}-bound segment")]
    UnknownSegmentKind { kind: u8, role: crate::PeerRole },

    /// An optional field id that the field spec does not declare.
    #[error("met field with unknown id {id} in {mode} mode")]
    UnknownField { id: u8, mode: &'static str },

    /// A list mode byte with an undefined partial-update nibble.
    #[error("unknown partial list mode: {0}")]
    UnknownPartialMode(u8),

    /// Dynamic decoding needed a descriptor table and none was bound.
    #[error("no entity definitions provided")]
    NoSpecSpace,

    /// Entity type id not present in the descriptor table.
    #[error("unknown entity type id {0}")]
    UnknownEntity(u8),

    /// Method id not present in the descriptor table.
    #[error("unknown method id {method} (entity type {entity:?})")]
    UnknownMethod { method: u8, entity: Option<u8> },

    /// Confirmation id not present in the descriptor table.
    #[error("unknown confirmation id {0}")]
    UnknownConfirmation(u8),

    /// A segment that can only continue an exchange arrived without one.
    #[error("unexpected {kind} segment on transaction {transaction}")]
    UnexpectedSegment {
        kind: &'static str,
        transaction: u8,
    },

    /// String bytes on the wire were not UTF-8.
    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A descriptor violates the id-width or uniqueness rules.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

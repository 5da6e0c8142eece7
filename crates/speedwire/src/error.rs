//! Unified error type for speedwire.

use speedwire_protocol::ProtocolError;
use speedwire_session::SessionError;
use speedwire_transport::TransportError;

use crate::ErrorCode;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `speedwire` meta-crate, you deal with this single
/// error type instead of importing errors from each sub-crate.
#[derive(Debug, thiserror::Error)]
pub enum SpeedwireError {
    /// A transport-level error (connect, accept, read, write).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, descriptors).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (transactions, usage, remote failures).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A handler was registered for a method the SpecSpace does not define.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// A handler refused the invocation. The dispatcher answers the client
    /// with this code and message.
    #[error("rejected with {code:?}: {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl SpeedwireError {
    /// Shorthand for a [`SpeedwireError::Rejected`] with the code's default
    /// message.
    pub fn rejected(code: ErrorCode) -> Self {
        Self::Rejected {
            code,
            message: code.message().to_string(),
        }
    }
}

//! Error types for the session layer.

use speedwire_protocol::ProtocolError;
use speedwire_transport::TransportError;

/// Errors that can occur while running a session.
///
/// Usage and resource errors are raised locally at the call site and are
/// never sent to the peer. [`SessionError::Rpc`] is the one variant that
/// comes from the other side: the server answered with a MethodError.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A server-only operation was called on a client session.
    #[error("{0} can only be called on the server")]
    ServerOnly(&'static str),

    /// Responding to an invocation that has no originating event, or that
    /// was already answered.
    #[error("no event to respond to")]
    NoEvent,

    /// The server asked for a confirmation but the caller gave no callback.
    /// The transaction stays open until the server resolves it.
    #[error("confirmation requested but no callback was provided")]
    MissingConfirmationCallback,

    /// The method spec does not list this confirmation.
    #[error("confirmation {id} is not allowed for method {method}")]
    ConfirmationNotAllowed { id: u8, method: String },

    /// Every transaction id is in use.
    #[error("no free transaction slots ({0} open)")]
    NoFreeTransaction(usize),

    /// The remote peer rejected the invocation.
    #[error("remote error {code}: {message}")]
    Rpc { code: u16, message: String },

    /// The session was closed, locally or by the peer.
    #[error("session closed")]
    Closed,

    /// Encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Writing to the stream failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

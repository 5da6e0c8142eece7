/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The stream ended before the requested bytes arrived.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Writing data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding, accepting or connecting failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The owner of the stream shut it down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    /// Returns `true` if the error means the peer went away rather than
    /// the stream misbehaving.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::Shutdown)
    }
}

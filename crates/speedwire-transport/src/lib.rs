//! Byte-stream contract for speedwire.
//!
//! The protocol core never looks at sockets. It needs exactly two
//! operations from whatever carries its bytes:
//!
//! - [`Readable::read`]: return exactly `n` bytes, waiting as long as
//!   it takes, failing when the stream closes;
//! - [`Writable::write`]: push a buffer out, failing on stream errors.
//!
//! Adapters are provided for any tokio `AsyncRead`/`AsyncWrite`
//! ([`StreamReader`], [`StreamWriter`], [`split`]), for in-memory
//! linked pairs ([`pipe`]) and for decoding a finished buffer
//! ([`SliceReader`]).
//!
//! # Feature Flags
//!
//! - `tcp` (default): [`TcpAcceptor`] and [`connect`] helpers

mod error;
mod memory;
mod stream;
#[cfg(feature = "tcp")]
mod tcp;

pub use error::TransportError;
pub use memory::{pipe, pipe_with_capacity, MemoryLink, MemoryReader, MemoryWriter, SliceReader};
pub use stream::{split, StreamReader, StreamWriter};
#[cfg(feature = "tcp")]
pub use tcp::{connect, TcpAcceptor, TcpReader, TcpWriter};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection, used to tell sessions apart in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The read half of a byte stream.
pub trait Readable: Send {
    /// Reads exactly `n` bytes.
    ///
    /// Suspends until all of them are available. Fails with
    /// [`TransportError::ConnectionClosed`] if the stream ends first.
    fn read(
        &mut self,
        n: usize,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send;
}

/// The write half of a byte stream.
pub trait Writable: Send {
    /// Writes the whole buffer and flushes it.
    fn write(
        &mut self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Shuts the write direction down. Defaults to a no-op.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_next_is_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_transport_error_is_closed() {
        assert!(TransportError::ConnectionClosed("eof".into()).is_closed());
        assert!(TransportError::Shutdown.is_closed());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x");
        assert!(!TransportError::SendFailed(io).is_closed());
    }
}

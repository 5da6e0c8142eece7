//! In-memory streams: linked pipe pairs and a reader over a finished buffer.

use bytes::Bytes;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

use crate::{split, Readable, StreamReader, StreamWriter, TransportError};

/// Default per-direction buffer of a [`pipe`].
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

pub type MemoryReader = StreamReader<ReadHalf<DuplexStream>>;
pub type MemoryWriter = StreamWriter<WriteHalf<DuplexStream>>;

/// One end of a [`pipe`]: what this end reads, and how it writes.
pub type MemoryLink = (MemoryReader, MemoryWriter);

/// Creates two linked in-memory ends. Bytes written on one end are read
/// on the other, in order.
pub fn pipe() -> (MemoryLink, MemoryLink) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Like [`pipe`], with an explicit per-direction buffer size.
pub fn pipe_with_capacity(capacity: usize) -> (MemoryLink, MemoryLink) {
    let (a, b) = tokio::io::duplex(capacity);
    (split(a), split(b))
}

/// [`Readable`] over a buffer that is already complete.
///
/// Used for standalone (de)serialization, where there is no peer and
/// running out of data means the input was truncated.
#[derive(Debug, Clone, Default)]
pub struct SliceReader {
    data: Bytes,
}

impl SliceReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }
}

impl Readable for SliceReader {
    async fn read(&mut self, n: usize) -> Result<Bytes, TransportError> {
        if n > self.data.len() {
            return Err(TransportError::ConnectionClosed(format!(
                "input truncated: wanted {n} bytes, {} left",
                self.data.len()
            )));
        }
        Ok(self.data.split_to(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Writable;

    #[tokio::test]
    async fn test_pipe_delivers_bytes_in_order() {
        let ((_a_read, mut a_write), (mut b_read, _b_write)) = pipe();

        a_write.write(&[1, 2, 3]).await.unwrap();
        a_write.write(&[4]).await.unwrap();

        assert_eq!(&b_read.read(4).await.unwrap()[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_pipe_closed_peer_fails_read() {
        let ((a_read, a_write), (mut b_read, _b_write)) = pipe();
        drop(a_read);
        drop(a_write);

        assert!(b_read.read(1).await.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_slice_reader_consumes_front() {
        let mut reader = SliceReader::new(vec![1u8, 2, 3]);
        assert_eq!(&reader.read(1).await.unwrap()[..], &[1]);
        assert_eq!(reader.remaining(), 2);
    }

    #[tokio::test]
    async fn test_slice_reader_truncated_input() {
        let mut reader = SliceReader::new(vec![1u8]);
        let err = reader.read(2).await.unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}

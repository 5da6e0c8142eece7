//! Adapters from tokio's `AsyncRead`/`AsyncWrite` to [`Readable`]/[`Writable`].

use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{Readable, TransportError, Writable};

/// [`Readable`] over any tokio reader.
#[derive(Debug)]
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin + Send> Readable for StreamReader<R> {
    async fn read(&mut self, n: usize) -> Result<Bytes, TransportError> {
        let mut buf = vec![0u8; n];
        match self.inner.read_exact(&mut buf).await {
            Ok(_) => Ok(Bytes::from(buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(
                TransportError::ConnectionClosed(format!(
                    "stream ended while waiting for {n} bytes"
                )),
            ),
            Err(e) => Err(TransportError::ReceiveFailed(e)),
        }
    }
}

/// [`Writable`] over any tokio writer.
#[derive(Debug)]
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send> Writable for StreamWriter<W> {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.inner
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        self.inner.flush().await.map_err(TransportError::SendFailed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }
}

/// Splits a bidirectional stream into its [`Readable`] and [`Writable`] halves.
pub fn split<S>(stream: S) -> (StreamReader<ReadHalf<S>>, StreamWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    (StreamReader::new(read), StreamWriter::new(write))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_reader_reads_exact_chunks() {
        let data: &[u8] = &[1, 2, 3, 4, 5];
        let mut reader = StreamReader::new(data);

        assert_eq!(&reader.read(2).await.unwrap()[..], &[1, 2]);
        assert_eq!(&reader.read(3).await.unwrap()[..], &[3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stream_reader_eof_is_connection_closed() {
        let data: &[u8] = &[1, 2];
        let mut reader = StreamReader::new(data);

        let err = reader.read(3).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_stream_reader_zero_bytes_does_not_wait() {
        let data: &[u8] = &[];
        let mut reader = StreamReader::new(data);
        assert!(reader.read(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_writer_writes_everything() {
        let mut writer = StreamWriter::new(Vec::new());
        writer.write(&[9, 8]).await.unwrap();
        writer.write(&[7]).await.unwrap();
        assert_eq!(writer.into_inner(), vec![9, 8, 7]);
    }
}

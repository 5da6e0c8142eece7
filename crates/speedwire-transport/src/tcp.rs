//! TCP transport helpers.

use std::net::SocketAddr;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::{split, ConnectionId, StreamReader, StreamWriter, TransportError};

pub type TcpReader = StreamReader<ReadHalf<TcpStream>>;
pub type TcpWriter = StreamWriter<WriteHalf<TcpStream>>;

/// Listens for incoming TCP connections.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Binds a listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Waits for the next connection and splits it into stream halves.
    pub async fn accept(
        &self,
    ) -> Result<(ConnectionId, TcpReader, TcpWriter), TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        stream.set_nodelay(true).map_err(TransportError::AcceptFailed)?;

        let id = ConnectionId::next();
        tracing::debug!(%id, %addr, "accepted TCP connection");

        let (reader, writer) = split(stream);
        Ok((id, reader, writer))
    }
}

/// Connects to a TCP peer and splits the stream into halves.
pub async fn connect(addr: &str) -> Result<(TcpReader, TcpWriter), TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(TransportError::AcceptFailed)?;
    stream.set_nodelay(true).map_err(TransportError::AcceptFailed)?;
    tracing::debug!(addr, "connected over TCP");
    Ok(split(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Readable, Writable};

    #[tokio::test]
    async fn test_tcp_accept_and_exchange() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.expect("should bind");
        let addr = acceptor.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (_id, mut reader, mut writer) = acceptor.accept().await.unwrap();
            let data = reader.read(5).await.unwrap();
            writer.write(&data).await.unwrap();
        });

        let (mut reader, mut writer) = connect(&addr).await.expect("should connect");
        writer.write(b"hello").await.unwrap();
        assert_eq!(&reader.read(5).await.unwrap()[..], b"hello");

        server.await.unwrap();
    }
}

//! `SpeedwireServer` builder and accept loop, plus the client-side
//! [`connect`].
//!
//! This is the entry point for running speedwire over TCP. It ties the
//! layers together: transport → session, one session per connection.

use std::sync::Arc;

use speedwire_protocol::{PeerRole, SpecSpace};
use speedwire_session::{Session, SessionConfig};
use speedwire_transport::{ConnectionId, TcpAcceptor};

use crate::SpeedwireError;

/// Builder for configuring and starting a speedwire server.
///
/// # Example
///
/// ```rust,ignore
/// use speedwire::prelude::*;
///
/// let server = SpeedwireServer::builder()
///     .bind("0.0.0.0:9000")
///     .build(space)
///     .await?;
/// server.run(|session| { /* attach a Server */ }).await
/// ```
pub struct SpeedwireServerBuilder {
    bind_addr: String,
    session_config: SessionConfig,
}

impl SpeedwireServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            session_config: SessionConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the configuration every accepted session runs with.
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Binds the listener.
    pub async fn build(self, space: Arc<SpecSpace>) -> Result<SpeedwireServer, SpeedwireError> {
        let acceptor = TcpAcceptor::bind(&self.bind_addr).await?;
        Ok(SpeedwireServer {
            acceptor,
            space,
            session_config: self.session_config.validated(),
        })
    }
}

impl Default for SpeedwireServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound speedwire server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct SpeedwireServer {
    acceptor: TcpAcceptor,
    space: Arc<SpecSpace>,
    session_config: SessionConfig,
}

impl SpeedwireServer {
    /// Creates a new builder.
    pub fn builder() -> SpeedwireServerBuilder {
        SpeedwireServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Accepts one connection and starts a server-role session on it.
    ///
    /// The session is already reading; use [`accept_with`](Self::accept_with)
    /// to attach handlers first.
    pub async fn accept(&self) -> Result<Session, SpeedwireError> {
        self.accept_with(|_| {}).await
    }

    /// Accepts one connection and runs `setup` on its session before the
    /// session reads its first segment.
    pub async fn accept_with<F>(&self, setup: F) -> Result<Session, SpeedwireError>
    where
        F: FnOnce(&Session),
    {
        let (id, reader, writer) = self.acceptor.accept().await?;
        Ok(Session::spawn_with(
            id,
            self.session_config.clone(),
            Arc::clone(&self.space),
            PeerRole::Server,
            reader,
            writer,
            setup,
        ))
    }

    /// Runs the accept loop, handing every new session to `on_session`
    /// before it starts reading. Runs until the process is terminated.
    pub async fn run<F>(self, on_session: F) -> Result<(), SpeedwireError>
    where
        F: Fn(Session) + Send + Sync + 'static,
    {
        tracing::info!(project = %self.space.project, "speedwire server running");

        loop {
            if let Err(e) = self.accept_with(|session| on_session(session.clone())).await {
                tracing::error!(error = %e, "accept failed");
            }
        }
    }
}

/// Connects to a speedwire server and starts a client-role session.
pub async fn connect(
    addr: &str,
    space: Arc<SpecSpace>,
    config: SessionConfig,
) -> Result<Session, SpeedwireError> {
    let (reader, writer) = speedwire_transport::connect(addr).await?;
    Ok(Session::spawn(
        ConnectionId::next(),
        config,
        space,
        PeerRole::Client,
        reader,
        writer,
    ))
}

//! # Speedwire
//!
//! Binary RPC and entity-sync protocol runtime.
//!
//! Two peers share a [`SpecSpace`](speedwire_protocol::SpecSpace) that
//! describes every method, entity and confirmation they can exchange.
//! Each connection runs a [`Session`](speedwire_session::Session); the
//! server side hangs a [`Server`] off it to route invocations to handlers
//! by method name.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use speedwire::prelude::*;
//!
//! // let space = Arc::new(SpecSpace::builder("demo", 1).method(...).build()?);
//! // let listener = SpeedwireServer::builder()
//! //     .bind("0.0.0.0:9000")
//! //     .build(space)
//! //     .await?;
//! // listener.run(|session| { Server::new(session, ()); }).await
//! ```

mod codes;
mod dispatch;
mod error;
mod server;

pub use codes::ErrorCode;
pub use dispatch::{RateLimiter, Server};
pub use error::SpeedwireError;
pub use server::{connect, SpeedwireServer, SpeedwireServerBuilder};

/// Installs a `tracing` subscriber that honors `RUST_LOG`, falling back to
/// `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub mod prelude {
    pub use std::sync::Arc;

    pub use speedwire_protocol::{
        Confirmation, ConfirmationSpec, Entity, EntitySpec, FieldSpec, FieldValue, Method,
        MethodSpec, PeerRole, Repr, SpecSpace, Value,
    };
    pub use speedwire_session::{
        ConfirmCallback, ConfirmationRequest, Invocation, Session, SessionConfig, SessionError,
        SessionEvent,
    };
    pub use speedwire_transport::ConnectionId;

    pub use crate::{connect, ErrorCode, Server, SpeedwireError, SpeedwireServer};
}

//! Session engine for speedwire.
//!
//! This crate turns a byte stream into a running protocol session:
//!
//! 1. **Transactions**: every exchange runs on an 8-bit id taken from a
//!    bounded table ([`Transaction`], [`Session::create_transaction`])
//! 2. **Method calls**: [`Session::invoke_method`] on the client, answered
//!    through [`Invocation`] on the server, with confirmations in between
//! 3. **Events**: unsolicited segments reach listeners registered with
//!    [`Session::subscribe`] as [`SessionEvent`]s
//!
//! # How it fits in the stack
//!
//! ```text
//! Dispatch Layer (above)  ← routes invocations to handlers by method name
//!     ↕
//! Session Layer (this crate)  ← transaction table, reader task, writer actor
//!     ↕
//! Protocol Layer (below)  ← segment and value codecs, SpecSpace
//! ```

mod config;
mod error;
mod event;
mod session;
mod table;
mod writer;

pub use config::SessionConfig;
pub use error::SessionError;
pub use event::{ConfirmationRequest, Invocation, SessionEvent};
pub use session::{ConfirmCallback, Session, Transaction};

//! Session configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a session.
///
/// Sensible defaults are provided; deserialize from any serde format to
/// override individual fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How many transactions may be open at once. At most 255: id 255
    /// is reserved.
    pub max_transactions: usize,

    /// Depth of the writer actor's queue. Senders wait when it is full.
    pub write_queue_depth: usize,

    /// Log every segment sent and received at `trace` level.
    pub trace_segments: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_transactions: Self::MAX_TRANSACTIONS,
            write_queue_depth: 64,
            trace_segments: false,
        }
    }
}

impl SessionConfig {
    /// Hard cap on concurrently open transactions.
    pub const MAX_TRANSACTIONS: usize = 255;

    /// Clamp any out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`Session::spawn`](crate::Session::spawn).
    /// - `max_transactions` clamped to `1..=255`.
    /// - `write_queue_depth` raised to at least 1.
    pub fn validated(mut self) -> Self {
        if self.max_transactions > Self::MAX_TRANSACTIONS {
            tracing::warn!(
                requested = self.max_transactions,
                max = Self::MAX_TRANSACTIONS,
                "max_transactions exceeds maximum, clamping"
            );
            self.max_transactions = Self::MAX_TRANSACTIONS;
        }
        if self.max_transactions == 0 {
            tracing::warn!("max_transactions is 0, raising to 1");
            self.max_transactions = 1;
        }
        self.write_queue_depth = self.write_queue_depth.max(1);
        self
    }
}

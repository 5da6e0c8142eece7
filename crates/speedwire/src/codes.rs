//! Standard error codes carried by MethodError segments.

use serde::{Deserialize, Serialize};

/// Error codes reserved by the runtime. Applications use the codes below
/// 65529 for their own failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum ErrorCode {
    InvalidState = 65535,
    ValidationFailed = 65534,
    RateLimit = 65533,
    ConfirmationFailed = 65532,
    InvalidId = 65531,
    InvalidGetModifier = 65530,
    InvalidEntity = 65529,
}

impl ErrorCode {
    pub const ALL: [Self; 7] = [
        Self::InvalidState,
        Self::ValidationFailed,
        Self::RateLimit,
        Self::ConfirmationFailed,
        Self::InvalidId,
        Self::InvalidGetModifier,
        Self::InvalidEntity,
    ];

    /// The numeric code sent on the wire.
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// Default message for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidState => "invalid state",
            Self::ValidationFailed => "validation failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ConfirmationFailed => "invalid confirmation result",
            Self::InvalidId => "invalid id",
            Self::InvalidGetModifier => "invalid get modifier",
            Self::InvalidEntity => "invalid entity",
        }
    }
}

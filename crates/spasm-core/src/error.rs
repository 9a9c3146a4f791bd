//! Error types for spasm-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame, unknown type, missing field or oversized header value
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A read wanted more bytes than are buffered; retry once more arrive
    #[error("Insufficient data: need {needed} more bytes")]
    InsufficientData { needed: usize },

    #[error("Key exchange error: {0}")]
    KeyExchange(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Malformed user-supplied condition text
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Promise not resolved")]
    Unresolved,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolViolation(message.into())
    }

    pub fn key_exchange(message: impl Into<String>) -> Self {
        Error::KeyExchange(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Error::Timeout(message.into())
    }

    /// Whether this error aborts only the affected session or connection.
    ///
    /// Anything else is unexpected and tears down the whole process role.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::InsufficientData { .. }
                | Error::KeyExchange(_)
                | Error::Timeout(_)
                | Error::Validation(_)
                | Error::Cancelled
        )
    }

    /// Short privacy-safe label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProtocolViolation(_) => "protocol_violation",
            Error::InsufficientData { .. } => "insufficient_data",
            Error::KeyExchange(_) => "key_exchange",
            Error::Timeout(_) => "timeout",
            Error::Validation(_) => "validation",
            Error::Cancelled => "cancelled",
            Error::Unresolved => "unresolved",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

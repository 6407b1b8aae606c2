//! Cache error types.

use thiserror::Error;

/// Errors produced by cache backends and the guarded client.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend reported a failure (connection refused, protocol error).
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// The backend rejected the call because a capacity or quota limit was
    /// exceeded. Opens the circuit breaker immediately.
    #[error("Cache capacity limit exceeded: {0}")]
    CapacityExceeded(String),

    /// A stored value could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The circuit breaker is open; the call was not attempted.
    #[error("Circuit breaker is open")]
    BreakerOpen,
}

impl CacheError {
    /// Whether the caller may retry this error later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::BreakerOpen)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<CacheError> for courier_common::AppError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err.to_string())
    }
}

//! Error types for the Windowgate service.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Windowgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Invalid policy or configuration, raised at construction only
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared counter store could not complete an admission check
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A remote address could not be turned into a client key
    #[error("Invalid client address: {0}")]
    InvalidClientAddr(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a counter store backend.
///
/// A missing field is never an error; backends report it as `None`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// The round trip did not finish in time. Carries the bound when the
    /// limiter applied it; socket timeouts inside the client carry `None`.
    #[error("timed out{}", .0.map(|d| format!(" after {:?}", d)).unwrap_or_default())]
    Timeout(Option<Duration>),

    /// The store answered with an error
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(None)
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result type alias for Windowgate operations.
pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_redis_socket_timeout_is_timeout() {
        let err =
            redis::RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        let err = StoreError::from(err);

        assert!(matches!(err, StoreError::Timeout(None)));
        assert_eq!(err.to_string(), "timed out");
    }

    #[test]
    fn test_redis_refusal_is_connection() {
        let err = redis::RedisError::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(StoreError::from(err), StoreError::Connection(_)));
    }

    #[test]
    fn test_bounded_timeout_reports_duration() {
        let err = StoreError::Timeout(Some(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "timed out after 250ms");
    }
}

//! Error types for session management operations.

use std::time::Duration;

/// Error type for session management operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session was not found in cache or store.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The backing store could not be reached or refused the operation.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// No pooled connection became available within the borrow timeout.
    #[error("Connection pool exhausted: no connection within {0:?}")]
    PoolExhausted(Duration),

    /// Operation attempted on a session that has already been invalidated.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Session payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store backend sent a reply that does not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error talking to the store backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration is malformed or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a store failure the handler may recover from
    /// by degrading to cache-only behaviour or retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Protocol(_) | Error::Io(_)
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        match e.kind() {
            redis::ErrorKind::TypeError => Error::Protocol(e.to_string()),
            _ => Error::StoreUnavailable(e.to_string()),
        }
    }
}

/// Result type for session management operations.
pub type Result<T> = std::result::Result<T, Error>;

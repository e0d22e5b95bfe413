//! Error handling for the market-data service.

use thiserror::Error;

/// Main error type for the market-data service
#[derive(Debug, Error)]
pub enum Error {
    /// Upstream answered with HTTP 429
    #[error("Upstream rate limit hit")]
    RateLimited,

    /// Upstream call exceeded its timeout
    #[error("Upstream request timed out")]
    NetworkTimeout,

    /// Upstream answered but the body could not be understood
    #[error("Malformed upstream response: {0}")]
    UpstreamMalformedResponse(String),

    /// Any other upstream failure (5xx, connection refused, ...)
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Store reported a lock it could not get within its busy timeout
    #[error("Storage contention: {0}")]
    StorageContention(String),

    /// Nothing cached and nothing could be fetched
    #[error("No data available: {0}")]
    NoDataAvailable(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Invalid argument errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-contention SQLite failures
    #[error("Storage error: {0}")]
    Storage(rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Expected runtime conditions that callers absorb by serving stale or
    /// empty data. Everything else points at a bug or a bad configuration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited
                | Error::NetworkTimeout
                | Error::UpstreamMalformedResponse(_)
                | Error::Upstream(_)
                | Error::StorageContention(_)
                | Error::NoDataAvailable(_)
        )
    }
}

/// Result type for the market-data service
pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::NetworkTimeout
        } else if err.is_decode() {
            Error::UpstreamMalformedResponse(err.to_string())
        } else if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            Error::RateLimited
        } else {
            Error::Upstream(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            | Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::StorageContention(err.to_string())
            }
            | _ => Error::Storage(err),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Other(format!("blocking task failed: {err}"))
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Other(err)
    }
}

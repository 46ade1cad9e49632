//! Error types for the ingestion pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion, classification and reconciliation.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient upstream failure (HTTP 429/5xx, transport error).
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The gateway gave up after exhausting its retries.
    #[error("Rate limit exceeded after {attempts} attempts: {last_error}")]
    RateLimitExceeded {
        /// Attempts made, including the first.
        attempts: u32,
        /// Display form of the final failure.
        last_error: String,
    },

    /// The circuit breaker is open; the call was not attempted.
    #[error("Circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        /// Remaining cool-down.
        retry_after: Duration,
    },

    /// A classifier failed while evaluating or maintaining its feed.
    #[error("Classifier '{feed}' error: {reason}")]
    Classifier {
        /// Feed name.
        feed: String,
        /// Description of the failure.
        reason: String,
    },

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store-level error that is not a raw SQLite failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Core type error (malformed cursor, invalid record).
    #[error(transparent)]
    Core(#[from] skyfeed_core::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller supplied bad input (e.g. a cursor we never issued).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_client_error())
    }

    /// Whether the error came from the gateway's protective limits.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_cursor_is_client_error() {
        let core = "garbage".parse::<skyfeed_core::Cursor>().unwrap_err();
        let err: Error = core.into();
        assert!(err.is_client_error());
        assert!(err.to_string().contains("malformed cursor"));
    }

    #[test]
    fn test_backpressure_classification() {
        let open = Error::CircuitOpen {
            retry_after: Duration::from_secs(3),
        };
        let exhausted = Error::RateLimitExceeded {
            attempts: 4,
            last_error: "HTTP 429".to_string(),
        };
        assert!(open.is_backpressure());
        assert!(exhausted.is_backpressure());
        assert!(exhausted.to_string().contains("4 attempts"));
        assert!(!Error::Upstream("boom".to_string()).is_backpressure());
        assert!(!open.is_client_error());
    }
}

//! Error types shared by the skyfeed crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core types.
#[derive(Error, Debug)]
pub enum Error {
    /// A pagination cursor could not be parsed.
    ///
    /// This is a client error: the caller supplied a token we never issued.
    #[error("malformed cursor '{cursor}': {reason}")]
    MalformedCursor {
        /// The raw cursor string as received.
        cursor: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A stream record is missing a required field or has the wrong shape.
    #[error("invalid record field '{field}': {reason}")]
    InvalidRecord {
        /// The name of the offending field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error was caused by bad caller input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedCursor { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_cursor_display() {
        let err = Error::MalformedCursor {
            cursor: "abc".to_string(),
            reason: "missing separator",
        };
        let msg = err.to_string();
        assert!(msg.contains("malformed cursor"));
        assert!(msg.contains("abc"));
        assert!(msg.contains("missing separator"));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_invalid_record_display() {
        let err = Error::InvalidRecord {
            field: "text",
            reason: "expected a string".to_string(),
        };
        assert!(err.to_string().contains("text"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}

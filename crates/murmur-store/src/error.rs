//! Error types for murmur-store

use std::time::Duration;

use thiserror::Error;

/// Result type alias using murmur-store Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the remote conversation API, plus input validation
#[derive(Error, Debug)]
pub enum Error {
    /// The request never got a response
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    /// The request was aborted after the fixed timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The API answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response body was not the expected JSON
    #[error("JSON error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configured base URL cannot have paths appended
    #[error("invalid base URL {0}")]
    InvalidUrl(String),

    /// Caller input was rejected before any I/O
    #[error("invalid input: {0}")]
    Validation(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same request later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Error::Decode(_) | Error::InvalidUrl(_) | Error::Validation(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failures inside the local cache. These are logged and degraded to empty
/// results; they are never returned from `LocalCache`.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache record '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cache record '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(15)).is_transient());
        assert!(
            Error::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            Error::Http {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_permanent_classification() {
        assert!(
            !Error::Http {
                status: 404,
                body: "not found".into()
            }
            .is_transient()
        );
        assert!(!Error::validation("blank").is_transient());
    }

    #[test]
    fn test_status() {
        let e = Error::Http {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(e.status(), Some(500));
        assert_eq!(Error::Timeout(Duration::from_secs(1)).status(), None);
        assert_eq!(e.to_string(), "HTTP 500: boom");
    }
}

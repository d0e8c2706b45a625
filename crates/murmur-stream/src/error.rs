//! Error types for murmur-stream

use thiserror::Error;

/// Result type alias using murmur-stream Error
pub type Result<T> = std::result::Result<T, StreamError>;

/// Crate-level alias, mirroring the other murmur crates.
pub type Error = StreamError;

/// Failures of the streaming transport.
///
/// These never escape a session as `Err`; the controller reports them through
/// `on_error` / `on_timeout` and its reconnection logic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Connection could not be made or broke mid-stream
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint answered with a non-success status
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// No acknowledgement (or no event) within the configured window
    #[error("timed out waiting for the stream")]
    Timeout,

    /// The stream closed without an `end` event
    #[error("stream closed before completion")]
    Interrupted,
}

impl StreamError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout)
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StreamError::Timeout
        } else if let Some(status) = e.status() {
            StreamError::Http {
                status: status.as_u16(),
            }
        } else {
            StreamError::Transport(e.to_string())
        }
    }
}

/// How a failed attempt is described to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Failed before the session ever opened
    Unreachable,
    /// Failed after at least one successful open
    ConnectionLost,
    /// Connect or idle timer fired
    TimedOut,
}

impl Failure {
    /// Classify a failure given whether the session has opened at least once.
    pub fn classify(error: &StreamError, has_opened: bool) -> Self {
        if error.is_timeout() {
            Failure::TimedOut
        } else if has_opened {
            Failure::ConnectionLost
        } else {
            Failure::Unreachable
        }
    }

    /// Human-readable explanation rendered inline in the conversation.
    pub fn user_message(&self) -> &'static str {
        match self {
            Failure::Unreachable => {
                "Sorry, the assistant service is unreachable. Make sure the backend is running and check your network connection."
            }
            Failure::ConnectionLost => "The connection to the assistant was lost, retrying...",
            Failure::TimedOut => {
                "Sorry, the connection timed out. Check your network connection or try again later."
            }
        }
    }
}

//! Session callbacks and the tagged event type

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::session::SessionId;

/// Receiver of one session's lifecycle callbacks.
///
/// Callbacks for a session are invoked strictly in order from that session's
/// task and carry the originating [`SessionId`]. After `close()` the task
/// stops at its next state change, but a callback already past that check
/// may still be delivered; consumers that outlive a session must filter by
/// [`SessionId`]. All methods default to no-ops.
pub trait SessionHandler: Send + 'static {
    /// The transport acknowledged the request
    fn on_open(&mut self, _session: SessionId) {}

    /// An incremental text fragment arrived
    fn on_delta(&mut self, _session: SessionId, _text: &str) {}

    /// The current attempt failed; `user_message` is the inline explanation
    fn on_error(&mut self, _session: SessionId, _error: &StreamError, _user_message: &str) {}

    /// The backend signalled completion
    fn on_end(&mut self, _session: SessionId) {}

    /// The connect (or idle) timer fired before the stream made progress
    fn on_timeout(&mut self, _session: SessionId) {}

    /// A reconnection has been scheduled
    fn on_reconnecting(&mut self, _session: SessionId, _attempt: u32, _max_attempts: u32) {}

    /// No attempts remain; the session is closed
    fn on_max_attempts_exhausted(&mut self, _session: SessionId) {}
}

/// A session callback captured as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    Open,
    Delta { text: String },
    Error { error: String, user_message: String },
    End,
    Timeout,
    Reconnecting { attempt: u32, max_attempts: u32 },
    MaxAttemptsExhausted,
}

impl SessionEventKind {
    /// Whether no further events follow for this session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEventKind::End | SessionEventKind::MaxAttemptsExhausted
        )
    }
}

/// Forwards every callback into a channel, for single-owner consumers that
/// multiplex sessions over one receiver.
impl SessionHandler for mpsc::UnboundedSender<SessionEvent> {
    fn on_open(&mut self, session: SessionId) {
        forward(self, session, SessionEventKind::Open);
    }

    fn on_delta(&mut self, session: SessionId, text: &str) {
        forward(
            self,
            session,
            SessionEventKind::Delta {
                text: text.to_string(),
            },
        );
    }

    fn on_error(&mut self, session: SessionId, error: &StreamError, user_message: &str) {
        forward(
            self,
            session,
            SessionEventKind::Error {
                error: error.to_string(),
                user_message: user_message.to_string(),
            },
        );
    }

    fn on_end(&mut self, session: SessionId) {
        forward(self, session, SessionEventKind::End);
    }

    fn on_timeout(&mut self, session: SessionId) {
        forward(self, session, SessionEventKind::Timeout);
    }

    fn on_reconnecting(&mut self, session: SessionId, attempt: u32, max_attempts: u32) {
        forward(
            self,
            session,
            SessionEventKind::Reconnecting {
                attempt,
                max_attempts,
            },
        );
    }

    fn on_max_attempts_exhausted(&mut self, session: SessionId) {
        forward(self, session, SessionEventKind::MaxAttemptsExhausted);
    }
}

fn forward(tx: &mpsc::UnboundedSender<SessionEvent>, session: SessionId, kind: SessionEventKind) {
    if tx.send(SessionEvent { session, kind }).is_err() {
        tracing::debug!("Session {} event dropped, receiver gone", session);
    }
}

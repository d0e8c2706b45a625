//! Caller-facing handle for one streaming session.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionId, SessionSnapshot, SessionState};

/// What `force_reconnect` does with the text received so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextPolicy {
    /// Keep `accumulated_text`; new deltas append to it
    #[default]
    KeepText,
    /// Start over from an empty `accumulated_text`
    DiscardText,
}

#[derive(Debug)]
pub(crate) enum Command {
    ForceReconnect(TextPolicy),
}

/// State shared between a handle and its session task.
pub(crate) struct Shared {
    pub(crate) snapshot: Mutex<SessionSnapshot>,
    pub(crate) closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn new(snapshot: SessionSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Mark the session closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.snapshot.lock().state = SessionState::Closed;
        true
    }
}

/// Handle to a running session.
///
/// Not `Clone`: whoever holds the handle owns the session. Dropping it closes
/// the session.
pub struct SessionHandle {
    id: SessionId,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        shared: Arc<Shared>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            shared,
            commands,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Close the session: cancels pending timers and reconnects and releases
    /// the transport. Idempotent; only the first call has any effect.
    pub fn close(&self) {
        if self.shared.mark_closed() {
            self.shared.cancel.cancel();
            tracing::debug!("Session {} closed", self.id);
        }
    }

    /// Drop the current transport and start again from attempt 1.
    ///
    /// Ignored once the session has ended or closed.
    pub fn force_reconnect(&self, policy: TextPolicy) {
        if self.is_terminal() {
            tracing::debug!("Session {} is terminal, ignoring force reconnect", self.id);
            return;
        }
        if self.commands.send(Command::ForceReconnect(policy)).is_err() {
            tracing::debug!("Session {} task already finished", self.id);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.snapshot.lock().state
    }

    pub fn accumulated_text(&self) -> String {
        self.shared.snapshot.lock().accumulated_text.clone()
    }

    pub fn attempt(&self) -> u32 {
        self.shared.snapshot.lock().attempt
    }

    /// Whether the session reached `Ended` or `Closed`
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

//! Streaming session controller: one state machine per chat turn

use std::{fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::mpsc,
    time::{Instant, sleep, sleep_until},
};
use uuid::Uuid;

use crate::{
    error::{Failure, StreamError},
    events::SessionHandler,
    handle::{Command, SessionHandle, Shared, TextPolicy},
    transport::{StreamRequest, StreamTransport, TransportEvent},
};

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total connection attempts per session, including the first
    pub max_attempts: u32,
    /// Delay before the first reconnection
    pub base_delay: Duration,
    /// Multiplier applied per further reconnection
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying once attempt `attempt` (1-based) has failed:
    /// `base_delay * backoff_factor^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

/// Session timing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// How long an attempt may stay in `Connecting`
    pub connect_timeout: Duration,
    /// How long an open stream may go without any event; `None` disables
    pub idle_timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Some(Duration::from_secs(60)),
            retry: RetryConfig::default(),
        }
    }
}

/// Identity of one session; every callback carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Connecting,
    Open,
    Streaming,
    Ended,
    Errored,
    TimedOut,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Closed)
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub target_conversation_id: String,
    pub state: SessionState,
    pub accumulated_text: String,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Opens streaming sessions over a transport
#[derive(Clone)]
pub struct StreamController {
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
}

impl StreamController {
    pub fn new(transport: Arc<dyn StreamTransport>, config: StreamConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start a session for `stream_key` sending `payload`.
    ///
    /// Must be called from within a tokio runtime; the session runs on its
    /// own task until it ends, exhausts its attempts, or the handle closes.
    pub fn open<H: SessionHandler>(
        &self,
        stream_key: impl Into<String>,
        payload: impl Into<String>,
        handler: H,
    ) -> SessionHandle {
        let id = SessionId::new();
        let stream_key = stream_key.into();
        let max_attempts = self.config.retry.max_attempts.max(1);

        let shared = Arc::new(Shared::new(SessionSnapshot {
            session_id: id,
            target_conversation_id: stream_key.clone(),
            state: SessionState::Connecting,
            accumulated_text: String::new(),
            attempt: 1,
            max_attempts,
        }));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            id,
            request: StreamRequest {
                stream_key,
                payload: payload.into(),
                last_event_id: None,
            },
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            max_attempts,
            shared: Arc::clone(&shared),
            commands: commands_rx,
            handler: Box::new(handler),
        };

        tracing::debug!("Session {} opening", id);
        tokio::spawn(task.run());

        SessionHandle::new(id, shared, commands_tx)
    }
}

enum AttemptOutcome {
    Ended,
    Failed(StreamError),
    TimedOut,
    Restart(TextPolicy),
    Cancelled,
}

enum Pause {
    Elapsed,
    Restart(TextPolicy),
    Cancelled,
}

struct SessionTask {
    id: SessionId,
    request: StreamRequest,
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
    max_attempts: u32,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    handler: Box<dyn SessionHandler>,
}

impl SessionTask {
    async fn run(mut self) {
        let mut attempt = 1u32;
        let mut has_opened = false;

        loop {
            if !self.transition(SessionState::Connecting, |s| s.attempt = attempt) {
                return;
            }

            let outcome = self.run_attempt(&mut has_opened).await;
            match outcome {
                AttemptOutcome::Cancelled => return,
                AttemptOutcome::Restart(policy) => {
                    self.restart(policy);
                    attempt = 1;
                    continue;
                }
                AttemptOutcome::Ended => {
                    if self.transition(SessionState::Ended, |_| {}) {
                        tracing::debug!("Session {} ended", self.id);
                        self.handler.on_end(self.id);
                    }
                    return;
                }
                AttemptOutcome::Failed(error) => {
                    let failure = Failure::classify(&error, has_opened);
                    if !self.transition(SessionState::Errored, |_| {}) {
                        return;
                    }
                    self.handler.on_error(self.id, &error, failure.user_message());
                    tracing::warn!(
                        "Session {} attempt {}/{} failed: {}",
                        self.id,
                        attempt,
                        self.max_attempts,
                        error
                    );
                }
                AttemptOutcome::TimedOut => {
                    if !self.transition(SessionState::TimedOut, |_| {}) {
                        return;
                    }
                    self.handler.on_timeout(self.id);
                    tracing::warn!(
                        "Session {} attempt {}/{} timed out",
                        self.id,
                        attempt,
                        self.max_attempts
                    );
                }
            }

            if attempt >= self.max_attempts {
                if self.shared.mark_closed() {
                    tracing::warn!(
                        "Session {} gave up after {} attempts",
                        self.id,
                        self.max_attempts
                    );
                    self.handler.on_max_attempts_exhausted(self.id);
                }
                return;
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            if self.is_closed() {
                return;
            }
            self.handler.on_reconnecting(self.id, attempt, self.max_attempts);
            tracing::debug!("Session {} reconnecting in {:?}", self.id, delay);

            match self.pause(delay).await {
                Pause::Elapsed => attempt += 1,
                Pause::Restart(policy) => {
                    self.restart(policy);
                    attempt = 1;
                }
                Pause::Cancelled => return,
            }
        }
    }

    async fn run_attempt(&mut self, has_opened: &mut bool) -> AttemptOutcome {
        let cancel = self.shared.cancel.clone();
        let connect_deadline = Instant::now() + self.config.connect_timeout;
        let transport = Arc::clone(&self.transport);
        let request = self.request.clone();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
            command = self.commands.recv() => return command_outcome(command),
            _ = sleep_until(connect_deadline) => return AttemptOutcome::TimedOut,
            result = transport.connect(&request) => match result {
                Ok(stream) => stream,
                Err(e) => return AttemptOutcome::Failed(e),
            },
        };

        let mut opened = false;
        loop {
            let deadline = if opened {
                self.config.idle_timeout.map(|idle| Instant::now() + idle)
            } else {
                Some(connect_deadline)
            };

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return AttemptOutcome::Cancelled,
                command = self.commands.recv() => return command_outcome(command),
                _ = sleep_until_opt(deadline) => return AttemptOutcome::TimedOut,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(TransportEvent::Open)) => {
                    if !opened {
                        opened = true;
                        *has_opened = true;
                        if !self.open() {
                            return AttemptOutcome::Cancelled;
                        }
                    }
                }
                Some(Ok(TransportEvent::Delta { text, id })) => {
                    // A delta implies the request was acknowledged.
                    if !opened {
                        opened = true;
                        *has_opened = true;
                        if !self.open() {
                            return AttemptOutcome::Cancelled;
                        }
                    }
                    if id.is_some() {
                        self.request.last_event_id = id;
                    }
                    if !self.transition(SessionState::Streaming, |s| {
                        s.accumulated_text.push_str(&text)
                    }) {
                        return AttemptOutcome::Cancelled;
                    }
                    self.handler.on_delta(self.id, &text);
                }
                // Only resets the idle deadline.
                Some(Ok(TransportEvent::KeepAlive)) => {}
                Some(Ok(TransportEvent::End)) => return AttemptOutcome::Ended,
                Some(Err(e)) => return AttemptOutcome::Failed(e),
                None => return AttemptOutcome::Failed(StreamError::Interrupted),
            }
        }
    }

    fn open(&mut self) -> bool {
        if !self.transition(SessionState::Open, |_| {}) {
            return false;
        }
        tracing::debug!("Session {} open", self.id);
        self.handler.on_open(self.id);
        true
    }

    async fn pause(&mut self, delay: Duration) -> Pause {
        let cancel = self.shared.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Pause::Cancelled,
            command = self.commands.recv() => match command_outcome(command) {
                AttemptOutcome::Restart(policy) => Pause::Restart(policy),
                _ => Pause::Cancelled,
            },
            _ = sleep(delay) => Pause::Elapsed,
        }
    }

    fn restart(&mut self, policy: TextPolicy) {
        tracing::debug!("Session {} force reconnect ({:?})", self.id, policy);
        if policy == TextPolicy::DiscardText {
            self.request.last_event_id = None;
            self.shared.snapshot.lock().accumulated_text.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Apply a state change unless the session was closed. Every callback is
    /// preceded by one of these, so a closed session stops reporting at its
    /// next step.
    fn transition(
        &self,
        state: SessionState,
        update: impl FnOnce(&mut SessionSnapshot),
    ) -> bool {
        let mut snapshot = self.shared.snapshot.lock();
        if self.is_closed() {
            return false;
        }
        snapshot.state = state;
        update(&mut snapshot);
        true
    }
}

fn command_outcome(command: Option<Command>) -> AttemptOutcome {
    match command {
        Some(Command::ForceReconnect(policy)) => AttemptOutcome::Restart(policy),
        // Every handle is gone, which closes the session.
        None => AttemptOutcome::Cancelled,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

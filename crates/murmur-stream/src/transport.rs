//! Transport abstraction for opening assistant streams

use std::{pin::Pin, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource, retry::Never};
use tokio_stream::Stream;

use crate::error::{Result, StreamError};

/// Name of the SSE event that signals completion
pub const END_EVENT: &str = "end";

/// Event name of unnamed SSE events, the only ones carrying text
pub const MESSAGE_EVENT: &str = "message";

/// Default bound for the health probe
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the controller asks a transport to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Target conversation / turn identifier
    pub stream_key: String,
    /// Outbound user text
    pub payload: String,
    /// Id of the last event delivered by an earlier attempt, if any
    pub last_event_id: Option<String>,
}

/// Events surfaced by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Request acknowledged
    Open,
    /// Incremental text, with the event id when the server sent one
    Delta { text: String, id: Option<String> },
    /// Any other named event; carries no text but proves the stream is alive
    KeepAlive,
    /// Named end-of-stream event
    End,
}

/// A stream of transport events; an `Err` item ends the attempt.
pub type TransportStream = Pin<Box<dyn Stream<Item = Result<TransportEvent>> + Send>>;

/// Opens one attempt of an assistant stream
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, request: &StreamRequest) -> Result<TransportStream>;
}

/// Server-sent events transport against the chat endpoint
pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
    chat_path: String,
    health_path: String,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chat_path: "/api/ai/chat".to_string(),
            health_path: "/api/ai/health".to_string(),
        }
    }

    /// Use a preconfigured client (proxies, TLS, default headers)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_chat_path(mut self, path: impl Into<String>) -> Self {
        self.chat_path = path.into();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the health endpoint. Any failure, including the 5 second bound
    /// elapsing, reads as unhealthy.
    pub async fn check_health(&self) -> bool {
        self.check_health_within(HEALTH_TIMEOUT).await
    }

    pub async fn check_health_within(&self, timeout: Duration) -> bool {
        let url = format!("{}{}", self.base_url, self.health_path);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Health check failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn connect(&self, request: &StreamRequest) -> Result<TransportStream> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        tracing::debug!("Opening SSE stream: {} (key {})", url, request.stream_key);

        let mut builder = self.client.get(&url).query(&[
            ("memoryId", request.stream_key.as_str()),
            ("message", request.payload.as_str()),
        ]);
        if let Some(id) = &request.last_event_id {
            builder = builder.header("Last-Event-ID", id.as_str());
        }

        let mut event_source = EventSource::new(builder)
            .map_err(|e| StreamError::transport(format!("failed to create event source: {e}")))?;
        // Reconnection is owned by the session controller.
        event_source.set_retry_policy(Box::new(Never));

        Ok(Box::pin(create_stream(event_source)))
    }
}

fn create_stream(mut event_source: EventSource) -> impl Stream<Item = Result<TransportEvent>> {
    stream! {
        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => yield Ok(TransportEvent::Open),
                Ok(Event::Message(message)) => {
                    if message.event == END_EVENT {
                        event_source.close();
                        yield Ok(TransportEvent::End);
                        return;
                    }
                    if message.event != MESSAGE_EVENT {
                        tracing::debug!("Ignoring SSE event '{}'", message.event);
                        yield Ok(TransportEvent::KeepAlive);
                        continue;
                    }
                    let id = (!message.id.is_empty()).then_some(message.id);
                    yield Ok(TransportEvent::Delta { text: message.data, id });
                }
                Err(e) => {
                    event_source.close();
                    yield Err(map_event_source_error(e));
                    return;
                }
            }
        }
        yield Err(StreamError::Interrupted);
    }
}

fn map_event_source_error(error: reqwest_eventsource::Error) -> StreamError {
    use reqwest_eventsource::Error as EsError;
    match error {
        EsError::Transport(e) => StreamError::from(e),
        EsError::InvalidStatusCode(status, _) => StreamError::Http {
            status: status.as_u16(),
        },
        EsError::StreamEnded => StreamError::Interrupted,
        other => StreamError::Transport(other.to_string()),
    }
}

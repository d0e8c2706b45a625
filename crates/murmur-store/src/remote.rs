//! Remote conversation API client

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{Error, Result};
use crate::types::{Conversation, ConversationPatch, Message, NewMessage};

const CONVERSATIONS: &str = "conversations";
const MESSAGES: &str = "messages";

/// CRUD surface of the conversation store.
///
/// The seam the synchronizer is generic over, so tests can substitute a
/// failing or in-memory remote.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Conversation>>;

    async fn create(&self, title: &str) -> Result<Conversation>;

    async fn update(&self, id: &str, patch: &ConversationPatch) -> Result<Conversation>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn append_message(&self, conversation_id: &str, message: &NewMessage) -> Result<Message>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Bound on every request, including reading the body
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// HTTP client for the conversation API
pub struct RemoteClient {
    client: Client,
    config: RemoteConfig,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    pub fn with_client(client: Client, config: RemoteConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Base URL with `segments` appended, each percent-encoded as one segment
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let base = &self.config.base_url;
        let mut url = Url::parse(base).map_err(|e| Error::InvalidUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(format!("{base}: cannot take a path")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>> {
        let response = request
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let body = self.send(request).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn classify(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.config.timeout)
        } else if let Some(status) = e.status() {
            Error::Http {
                status: status.as_u16(),
                body: String::new(),
            }
        } else {
            Error::Network(e)
        }
    }
}

#[async_trait]
impl ConversationApi for RemoteClient {
    async fn list(&self) -> Result<Vec<Conversation>> {
        let url = self.url(&[CONVERSATIONS])?;
        self.send_json(self.client.get(url)).await
    }

    async fn create(&self, title: &str) -> Result<Conversation> {
        let now = Utc::now();
        let body = json!({
            "title": title,
            "createdAt": now,
            "updatedAt": now,
        });
        let url = self.url(&[CONVERSATIONS])?;
        self.send_json(self.client.post(url).json(&body)).await
    }

    async fn update(&self, id: &str, patch: &ConversationPatch) -> Result<Conversation> {
        let mut body = serde_json::to_value(patch)?;
        if let Some(object) = body.as_object_mut() {
            object.insert("updatedAt".to_string(), json!(Utc::now()));
        }
        let url = self.url(&[CONVERSATIONS, id])?;
        self.send_json(self.client.put(url).json(&body)).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.url(&[CONVERSATIONS, id])?;
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let url = self.url(&[CONVERSATIONS, conversation_id, MESSAGES])?;
        let mut messages: Vec<Message> = self.send_json(self.client.get(url)).await?;
        for message in &mut messages {
            if message.conversation_id.is_empty() {
                message.conversation_id = conversation_id.to_string();
            }
        }
        Ok(messages)
    }

    async fn append_message(&self, conversation_id: &str, message: &NewMessage) -> Result<Message> {
        let body = json!({
            "role": message.role,
            "text": message.text,
            "createdAt": Utc::now(),
        });
        let url = self.url(&[CONVERSATIONS, conversation_id, MESSAGES])?;
        let mut saved: Message = self.send_json(self.client.post(url).json(&body)).await?;
        if saved.conversation_id.is_empty() {
            saved.conversation_id = conversation_id.to_string();
        }
        Ok(saved)
    }
}

/// Whether a status means the item is already gone
pub(crate) fn is_not_found(error: &Error) -> bool {
    error.status() == Some(StatusCode::NOT_FOUND.as_u16())
}

//! Conversation and message records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    #[serde(alias = "ai")]
    Assistant,
}

/// A conversation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Text of the most recently saved message
    #[serde(default, deserialize_with = "string_or_null")]
    pub last_message: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Durable copy exists only in the local cache
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
}

impl Conversation {
    /// A conversation created without the remote store
    pub fn new_local(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_local_id(),
            title: title.into(),
            last_message: String::new(),
            created_at: now,
            updated_at: now,
            local_only: true,
        }
    }
}

/// A saved message within one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(alias = "content", default, deserialize_with = "string_or_null")]
    pub text: String,
    pub role: Role,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_only: bool,
}

impl Message {
    /// A message saved without the remote store
    pub fn new_local(conversation_id: impl Into<String>, message: NewMessage) -> Self {
        Self {
            id: generate_local_id(),
            conversation_id: conversation_id.into(),
            text: message.text,
            role: message.role,
            created_at: Utc::now(),
            local_only: true,
        }
    }
}

/// Message content before it has an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    pub text: String,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Partial update of a conversation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

impl ConversationPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Reject patches that would leave a conversation without a title
    pub fn validate(&self) -> Result<()> {
        match &self.title {
            Some(title) if title.trim().is_empty() => {
                Err(Error::validation("conversation title must not be blank"))
            }
            _ => Ok(()),
        }
    }

    pub fn apply(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = title.clone();
        }
        if let Some(last_message) = &self.last_message {
            conversation.last_message = last_message.clone();
        }
    }
}

/// Collision-resistant id for records the remote never assigned
pub fn generate_local_id() -> String {
    Uuid::new_v4().to_string()
}

fn string_or_null<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Option::unwrap_or_default)
}

//! Observer-facing state and events

use murmur_store::{Conversation, Message};
use serde::{Deserialize, Serialize};

/// Reflects the most recent streaming session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub is_connected: bool,
    pub is_reconnecting: bool,
    /// User-facing text of the latest failure
    pub last_error: Option<String>,
}

/// Everything a UI needs to render the chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub current_conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub connection: ConnectionState,
    pub conversations: Vec<Conversation>,
}

/// Change notifications broadcast by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A fragment was appended to the streaming assistant message
    Delta { message_id: String, text: String },

    /// The message list changed beyond a plain delta
    MessagesChanged,

    ConversationsChanged,

    ConnectionChanged { state: ConnectionState },

    LoadingChanged { is_loading: bool },

    /// A different conversation became active
    ConversationSelected { conversation_id: String },
}

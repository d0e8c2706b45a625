//! murmur-chat: the chat orchestrator
//!
//! Owns the active conversation, the in-memory message list and connection
//! state, feeds streaming deltas into a placeholder assistant message, and
//! persists both sides of every turn through the synchronizer.

pub mod error;
pub mod events;
pub mod orchestrator;

pub use error::{Error, Result};
pub use events::{ChatEvent, ChatSnapshot, ConnectionState};
pub use orchestrator::{ChatConfig, ChatOrchestrator};

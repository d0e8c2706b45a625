//! murmur-store: conversation persistence
//!
//! The remote conversation API is authoritative; the local cache keeps a
//! durable copy of everything and stands in whenever the remote is
//! unreachable. [`Synchronizer`] ties the two together.

pub mod error;
pub mod local;
pub mod remote;
pub mod sync;
pub mod types;

pub use error::{Error, Result, StorageError};
pub use local::{FileKv, KvBackend, LocalCache, MemoryKv};
pub use remote::{ConversationApi, RemoteClient, RemoteConfig};
pub use sync::Synchronizer;
pub use types::*;

//! Local cache store: two keyed records in a string key/value backend
//!
//! One record holds the conversation list, the other maps conversation ids to
//! their ordered message lists. Every public operation is synchronous and
//! infallible; storage failures are logged and read as empty.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StorageError;
use crate::types::{Conversation, Message};

/// Key of the conversation list record
pub const CONVERSATIONS_KEY: &str = "murmur-conversations";
/// Key of the conversation-id to messages record
pub const MESSAGES_KEY: &str = "murmur-messages";

type MessageMap = BTreeMap<String, Vec<Message>>;

/// String key/value storage
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// In-process backend, used for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One file per key under a directory
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data_local_dir>/murmur/cache`
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("murmur")
            .join("cache")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KvBackend for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        // Write-then-rename so a crash never leaves a half-written record.
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Durable local copy of conversations and messages
pub struct LocalCache {
    backend: Box<dyn KvBackend>,
    // Serializes read-modify-write cycles across both records.
    write_lock: Mutex<()>,
}

impl LocalCache {
    pub fn new(backend: impl KvBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryKv::new())
    }

    /// Conversations, most recently updated first
    pub fn list_conversations(&self) -> Vec<Conversation> {
        let _guard = self.write_lock.lock();
        self.load_conversations()
    }

    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.list_conversations().into_iter().find(|c| c.id == id)
    }

    /// Insert or replace by id. `updated_at` never moves backwards.
    pub fn upsert_conversation(&self, mut conversation: Conversation) {
        let _guard = self.write_lock.lock();
        let mut conversations = self.load_conversations();
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => {
                conversation.updated_at = conversation.updated_at.max(existing.updated_at);
                *existing = conversation;
            }
            None => conversations.push(conversation),
        }
        sort_conversations(&mut conversations);
        self.store(CONVERSATIONS_KEY, &conversations);
    }

    /// Replace the whole conversation list; returns it in cache order
    pub fn replace_conversations(&self, mut conversations: Vec<Conversation>) -> Vec<Conversation> {
        let _guard = self.write_lock.lock();
        sort_conversations(&mut conversations);
        self.store(CONVERSATIONS_KEY, &conversations);
        conversations
    }

    /// Remove a conversation together with its messages
    pub fn delete_conversation(&self, id: &str) {
        let _guard = self.write_lock.lock();
        let mut conversations = self.load_conversations();
        conversations.retain(|c| c.id != id);
        self.store(CONVERSATIONS_KEY, &conversations);

        let mut messages = self.load_messages();
        if messages.remove(id).is_some() {
            self.store(MESSAGES_KEY, &messages);
        }
    }

    pub fn list_messages(&self, conversation_id: &str) -> Vec<Message> {
        let _guard = self.write_lock.lock();
        self.load_messages()
            .remove(conversation_id)
            .unwrap_or_default()
    }

    /// Append to the end of the conversation's list and refresh the
    /// conversation's `last_message` / `updated_at` in the same step.
    pub fn append_message(&self, conversation_id: &str, mut message: Message) {
        if message.conversation_id.is_empty() {
            message.conversation_id = conversation_id.to_string();
        }

        let _guard = self.write_lock.lock();
        let mut messages = self.load_messages();
        messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        if !self.store(MESSAGES_KEY, &messages) {
            return;
        }

        let mut conversations = self.load_conversations();
        match conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conversation) => {
                conversation.last_message = message.text;
                conversation.updated_at = conversation.updated_at.max(message.created_at);
                sort_conversations(&mut conversations);
                self.store(CONVERSATIONS_KEY, &conversations);
            }
            None => {
                tracing::debug!(
                    "Cached message for unknown conversation {}",
                    conversation_id
                );
            }
        }
    }

    /// Replace one conversation's message list
    pub fn replace_messages(&self, conversation_id: &str, list: Vec<Message>) {
        let _guard = self.write_lock.lock();
        let mut messages = self.load_messages();
        messages.insert(conversation_id.to_string(), list);
        self.store(MESSAGES_KEY, &messages);
    }

    fn load_conversations(&self) -> Vec<Conversation> {
        self.load(CONVERSATIONS_KEY).unwrap_or_default()
    }

    fn load_messages(&self) -> MessageMap {
        self.load(MESSAGES_KEY).unwrap_or_default()
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let result = self.backend.get(key).and_then(|raw| match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        });
        match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Local cache read failed, treating as empty: {}", e);
                None
            }
        }
    }

    fn store<T: Serialize>(&self, key: &str, value: &T) -> bool {
        let result = serde_json::to_string(value)
            .map_err(|source| StorageError::Encode {
                key: key.to_string(),
                source,
            })
            .and_then(|raw| self.backend.set(key, &raw));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Local cache write failed: {}", e);
                false
            }
        }
    }
}

fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewMessage, Role};
    use chrono::{Duration, TimeZone, Utc};

    fn conversation(id: &str, minutes: i64) -> Conversation {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes);
        Conversation {
            id: id.to_string(),
            title: format!("conversation {id}"),
            last_message: String::new(),
            created_at: at,
            updated_at: at,
            local_only: false,
        }
    }

    struct BrokenKv;

    impl KvBackend for BrokenKv {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn test_conversations_most_recent_first() {
        let cache = LocalCache::in_memory();
        cache.upsert_conversation(conversation("a", 0));
        cache.upsert_conversation(conversation("c", 10));
        cache.upsert_conversation(conversation("b", 5));

        let ids: Vec<_> = cache
            .list_conversations()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_upsert_replaces_and_never_rewinds_updated_at() {
        let cache = LocalCache::in_memory();
        cache.upsert_conversation(conversation("a", 10));

        let mut stale = conversation("a", 0);
        stale.title = "renamed".into();
        cache.upsert_conversation(stale);

        let all = cache.list_conversations();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
        assert_eq!(all[0].updated_at, conversation("a", 10).updated_at);
    }

    #[test]
    fn test_append_updates_derived_fields() {
        let cache = LocalCache::in_memory();
        cache.upsert_conversation(conversation("a", 0));
        cache.upsert_conversation(conversation("b", 5));

        let mut message = Message::new_local("a", NewMessage::user("T"));
        message.created_at = conversation("x", 30).created_at;
        cache.append_message("a", message.clone());

        let a = cache.get_conversation("a").unwrap();
        assert_eq!(a.last_message, "T");
        assert_eq!(a.updated_at, message.created_at);
        // Touched conversation moves to the front.
        assert_eq!(cache.list_conversations()[0].id, "a");
    }

    #[test]
    fn test_messages_keep_append_order() {
        let cache = LocalCache::in_memory();
        cache.upsert_conversation(conversation("a", 0));
        for text in ["one", "two", "three"] {
            cache.append_message("a", Message::new_local("a", NewMessage::user(text)));
        }
        cache.append_message("b", Message::new_local("b", NewMessage::assistant("other")));

        let texts: Vec<_> = cache
            .list_messages("a")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(cache.list_messages("b")[0].role, Role::Assistant);
    }

    #[test]
    fn test_append_fills_missing_conversation_id() {
        let cache = LocalCache::in_memory();
        let mut message = Message::new_local("", NewMessage::user("hi"));
        message.conversation_id.clear();
        cache.append_message("a", message);
        assert_eq!(cache.list_messages("a")[0].conversation_id, "a");
    }

    #[test]
    fn test_delete_purges_messages() {
        let cache = LocalCache::in_memory();
        cache.upsert_conversation(conversation("a", 0));
        cache.upsert_conversation(conversation("b", 0));
        cache.append_message("a", Message::new_local("a", NewMessage::user("x")));
        cache.append_message("b", Message::new_local("b", NewMessage::user("y")));

        cache.delete_conversation("a");
        assert!(cache.get_conversation("a").is_none());
        assert!(cache.list_messages("a").is_empty());
        assert_eq!(cache.list_messages("b").len(), 1);
    }

    #[test]
    fn test_corrupt_records_read_as_empty() {
        let kv = MemoryKv::new();
        kv.set(CONVERSATIONS_KEY, "{not json").unwrap();
        kv.set(MESSAGES_KEY, "[1, 2").unwrap();
        let cache = LocalCache::new(kv);

        assert!(cache.list_conversations().is_empty());
        assert!(cache.list_messages("a").is_empty());

        // The next write replaces the corrupt record.
        cache.upsert_conversation(conversation("a", 0));
        assert_eq!(cache.list_conversations().len(), 1);
    }

    #[test]
    fn test_broken_backend_never_fails_callers() {
        let cache = LocalCache::new(BrokenKv);
        cache.upsert_conversation(conversation("a", 0));
        cache.append_message("a", Message::new_local("a", NewMessage::user("x")));
        cache.delete_conversation("a");
        assert!(cache.list_conversations().is_empty());
        assert!(cache.list_messages("a").is_empty());
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = LocalCache::new(FileKv::new(dir.path()));
            cache.upsert_conversation(conversation("a", 0));
            cache.append_message("a", Message::new_local("a", NewMessage::user("kept")));
        }

        let cache = LocalCache::new(FileKv::new(dir.path()));
        assert_eq!(cache.get_conversation("a").unwrap().last_message, "kept");
        assert_eq!(cache.list_messages("a")[0].text, "kept");
        assert!(dir.path().join(format!("{CONVERSATIONS_KEY}.json")).exists());
    }

    #[test]
    fn test_file_backend_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path().join("nested"));
        assert!(kv.get("absent").unwrap().is_none());
    }
}

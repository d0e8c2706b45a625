//! Conversation synchronizer: remote first, local cache fallback
//!
//! Every operation tries the remote API. A success is mirrored into the local
//! cache; a failure is logged, remembered for diagnostics, and answered from
//! the cache instead. Writes made during an outage stay in the cache marked
//! `local_only`; nothing promotes them to the remote later.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::local::LocalCache;
use crate::remote::{ConversationApi, is_not_found};
use crate::types::{Conversation, ConversationPatch, Message, NewMessage};

pub struct Synchronizer<R> {
    remote: R,
    local: LocalCache,
    last_remote_error: Mutex<Option<String>>,
}

impl<R: ConversationApi> Synchronizer<R> {
    pub fn new(remote: R, local: LocalCache) -> Self {
        Self {
            remote,
            local,
            last_remote_error: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// The most recent remote failure that was absorbed by a fallback
    pub fn last_remote_error(&self) -> Option<String> {
        self.last_remote_error.lock().clone()
    }

    /// All conversations, most recently updated first
    pub async fn list(&self) -> Vec<Conversation> {
        match self.remote.list().await {
            Ok(remote) => {
                let cached = self.local.list_conversations();
                let remote_ids: HashSet<&str> = remote.iter().map(|c| c.id.as_str()).collect();
                let kept: Vec<Conversation> = cached
                    .iter()
                    .filter(|c| c.local_only && !remote_ids.contains(c.id.as_str()))
                    .cloned()
                    .collect();

                let mut merged: Vec<Conversation> = remote
                    .into_iter()
                    .map(|c| merge_cached(c, &cached))
                    .collect();
                merged.extend(kept);
                self.local.replace_conversations(merged)
            }
            Err(e) => {
                self.record_failure("list conversations", &e);
                self.local.list_conversations()
            }
        }
    }

    /// Create a conversation. Never fails: an unreachable remote yields a
    /// local-only conversation with a locally generated id.
    pub async fn create(&self, title: &str) -> Conversation {
        let conversation = match self.remote.create(title).await {
            Ok(conversation) => conversation,
            Err(e) => {
                self.record_failure("create conversation", &e);
                Conversation::new_local(title)
            }
        };
        self.local.upsert_conversation(conversation.clone());
        conversation
    }

    /// Apply `patch` to a conversation.
    ///
    /// Only a blank title is rejected. Returns `None` when neither store knows
    /// the conversation.
    pub async fn update(
        &self,
        id: &str,
        patch: &ConversationPatch,
    ) -> Result<Option<Conversation>> {
        patch.validate()?;

        let cached = self.local.get_conversation(id);
        if !cached.as_ref().is_some_and(|c| c.local_only) {
            match self.remote.update(id, patch).await {
                Ok(updated) => {
                    let updated = merge_cached(updated, cached.as_slice());
                    self.local.upsert_conversation(updated.clone());
                    return Ok(Some(updated));
                }
                Err(e) => self.record_failure("update conversation", &e),
            }
        }

        Ok(cached.map(|mut conversation| {
            patch.apply(&mut conversation);
            conversation.updated_at = Utc::now();
            self.local.upsert_conversation(conversation.clone());
            conversation
        }))
    }

    /// Delete a conversation and its messages. The local copy is always
    /// removed, whatever the remote says.
    pub async fn delete(&self, id: &str) {
        if !self.is_local_only(id) {
            match self.remote.delete(id).await {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {
                    tracing::debug!("Conversation {} already gone remotely", id);
                }
                Err(e) => self.record_failure("delete conversation", &e),
            }
        }
        self.local.delete_conversation(id);
    }

    /// Messages of one conversation in saved order.
    ///
    /// A successful remote read replaces cached copies by id, appends messages
    /// the cache has not seen, and keeps local-only messages where they were.
    pub async fn list_messages(&self, conversation_id: &str) -> Vec<Message> {
        if self.is_local_only(conversation_id) {
            return self.local.list_messages(conversation_id);
        }

        match self.remote.list_messages(conversation_id).await {
            Ok(remote) => {
                let merged = merge_messages(self.local.list_messages(conversation_id), remote);
                self.local.replace_messages(conversation_id, merged.clone());
                merged
            }
            Err(e) => {
                self.record_failure("list messages", &e);
                self.local.list_messages(conversation_id)
            }
        }
    }

    /// Save a message at the end of a conversation.
    ///
    /// The returned message is durable in the local cache even when the
    /// remote write failed; its id is then local and stays stable.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<Message> {
        if conversation_id.trim().is_empty() {
            return Err(Error::validation("message needs a conversation id"));
        }

        let saved = if self.is_local_only(conversation_id) {
            Message::new_local(conversation_id, message)
        } else {
            match self.remote.append_message(conversation_id, &message).await {
                Ok(saved) => saved,
                Err(e) => {
                    self.record_failure("append message", &e);
                    Message::new_local(conversation_id, message)
                }
            }
        };

        self.local.append_message(conversation_id, saved.clone());
        Ok(saved)
    }

    fn is_local_only(&self, conversation_id: &str) -> bool {
        self.local
            .get_conversation(conversation_id)
            .is_some_and(|c| c.local_only)
    }

    fn record_failure(&self, operation: &str, error: &Error) {
        tracing::warn!("Remote {} failed, using local cache: {}", operation, error);
        *self.last_remote_error.lock() = Some(format!("{operation}: {error}"));
    }
}

/// Fill fields the remote left empty from the cached copy and keep
/// `updated_at` from moving backwards.
fn merge_cached(mut remote: Conversation, cached: &[Conversation]) -> Conversation {
    if let Some(local) = cached.iter().find(|c| c.id == remote.id) {
        if remote.last_message.is_empty() {
            remote.last_message = local.last_message.clone();
        }
        remote.updated_at = remote.updated_at.max(local.updated_at);
    }
    remote
}

fn merge_messages(cached: Vec<Message>, remote: Vec<Message>) -> Vec<Message> {
    let order: Vec<String> = remote.iter().map(|m| m.id.clone()).collect();
    let mut by_id: HashMap<String, Message> =
        remote.into_iter().map(|m| (m.id.clone(), m)).collect();

    let mut merged = Vec::with_capacity(cached.len() + by_id.len());
    for message in cached {
        if let Some(fresh) = by_id.remove(&message.id) {
            merged.push(fresh);
        } else if message.local_only {
            merged.push(message);
        }
    }
    for id in order {
        if let Some(message) = by_id.remove(&id) {
            merged.push(message);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory remote with a kill switch
    #[derive(Default)]
    struct FakeRemote {
        down: AtomicBool,
        calls: AtomicUsize,
        next_id: AtomicUsize,
        conversations: Mutex<Vec<Conversation>>,
        messages: Mutex<HashMap<String, Vec<Message>>>,
    }

    impl FakeRemote {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(Error::Timeout(Duration::from_secs(15)))
            } else {
                Ok(())
            }
        }

        fn id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl ConversationApi for FakeRemote {
        async fn list(&self) -> Result<Vec<Conversation>> {
            self.check()?;
            Ok(self.conversations.lock().clone())
        }

        async fn create(&self, title: &str) -> Result<Conversation> {
            self.check()?;
            let mut conversation = Conversation::new_local(title);
            conversation.id = self.id("r");
            conversation.local_only = false;
            self.conversations.lock().push(conversation.clone());
            Ok(conversation)
        }

        async fn update(&self, id: &str, patch: &ConversationPatch) -> Result<Conversation> {
            self.check()?;
            let mut conversations = self.conversations.lock();
            let conversation = conversations
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(Error::Http {
                    status: 404,
                    body: String::new(),
                })?;
            patch.apply(conversation);
            Ok(conversation.clone())
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.check()?;
            self.conversations.lock().retain(|c| c.id != id);
            Ok(())
        }

        async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
            self.check()?;
            Ok(self
                .messages
                .lock()
                .get(conversation_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn append_message(
            &self,
            conversation_id: &str,
            message: &NewMessage,
        ) -> Result<Message> {
            self.check()?;
            let mut saved = Message::new_local(conversation_id, message.clone());
            saved.id = self.id("m");
            saved.local_only = false;
            self.messages
                .lock()
                .entry(conversation_id.to_string())
                .or_default()
                .push(saved.clone());
            Ok(saved)
        }
    }

    fn synchronizer() -> Synchronizer<FakeRemote> {
        Synchronizer::new(FakeRemote::default(), LocalCache::in_memory())
    }

    #[tokio::test]
    async fn test_create_mirrors_remote_record() {
        let sync = synchronizer();
        let conversation = sync.create("hello").await;
        assert_eq!(conversation.id, "r-0");
        assert!(!conversation.local_only);
        assert_eq!(sync.local().get_conversation("r-0"), Some(conversation));
        assert!(sync.last_remote_error().is_none());
    }

    #[tokio::test]
    async fn test_create_falls_back_to_local_record() {
        let sync = synchronizer();
        sync.remote().set_down(true);

        let conversation = sync.create("offline").await;
        assert!(conversation.local_only);
        assert_eq!(sync.list().await, vec![conversation]);
        assert!(
            sync.last_remote_error()
                .unwrap()
                .starts_with("create conversation")
        );
    }

    #[tokio::test]
    async fn test_messages_survive_total_remote_failure() {
        let sync = synchronizer();
        let conversation = sync.create("chat").await;
        sync.remote().set_down(true);

        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            let saved = sync
                .append_message(&conversation.id, NewMessage::user(text))
                .await
                .unwrap();
            assert!(saved.local_only);
            ids.push(saved.id);
        }

        let first: Vec<_> = sync.list_messages(&conversation.id).await;
        let second: Vec<_> = sync.list_messages(&conversation.id).await;
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(
            first.iter().map(|m| m.text.as_str()).collect::<Vec<_>>(),
            vec!["one", "two", "three"]
        );

        // Local-only messages stay put once the remote is back.
        sync.remote().set_down(false);
        let after = sync.list_messages(&conversation.id).await;
        assert_eq!(after, first);
    }

    #[tokio::test]
    async fn test_append_updates_derived_fields_on_fallback() {
        let sync = synchronizer();
        sync.remote().set_down(true);
        let conversation = sync.create("chat").await;

        let saved = sync
            .append_message(&conversation.id, NewMessage::user("T"))
            .await
            .unwrap();

        let listed = sync.list().await;
        assert_eq!(listed[0].last_message, "T");
        assert_eq!(listed[0].updated_at, saved.created_at);
        let cached = sync.local().get_conversation(&conversation.id).unwrap();
        assert_eq!(cached.last_message, "T");
        assert_eq!(cached.updated_at, saved.created_at);
    }

    #[tokio::test]
    async fn test_append_rejects_missing_conversation_id() {
        let sync = synchronizer();
        let result = sync.append_message("  ", NewMessage::user("x")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(sync.remote().calls(), 0);
    }

    #[tokio::test]
    async fn test_local_only_conversations_skip_remote() {
        let sync = synchronizer();
        sync.remote().set_down(true);
        let conversation = sync.create("offline").await;
        sync.remote().set_down(false);
        let before = sync.remote().calls();

        sync.append_message(&conversation.id, NewMessage::user("hi"))
            .await
            .unwrap();
        sync.list_messages(&conversation.id).await;
        sync.update(&conversation.id, &ConversationPatch::title("renamed"))
            .await
            .unwrap();
        sync.delete(&conversation.id).await;

        assert_eq!(sync.remote().calls(), before);
        assert!(sync.local().get_conversation(&conversation.id).is_none());
    }

    #[tokio::test]
    async fn test_list_keeps_local_only_conversations() {
        let sync = synchronizer();
        let online = sync.create("online").await;
        sync.remote().set_down(true);
        let offline = sync.create("offline").await;
        sync.remote().set_down(false);

        let listed = sync.list().await;
        let ids: HashSet<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(listed.len(), 2);
        assert!(ids.contains(online.id.as_str()));
        assert!(ids.contains(offline.id.as_str()));
    }

    #[tokio::test]
    async fn test_remote_messages_merge_in_order() {
        let sync = synchronizer();
        let conversation = sync.create("chat").await;
        sync.append_message(&conversation.id, NewMessage::user("q"))
            .await
            .unwrap();
        sync.remote().set_down(true);
        sync.append_message(&conversation.id, NewMessage::user("offline"))
            .await
            .unwrap();
        sync.remote().set_down(false);
        // Another client answered in the meantime.
        sync.remote()
            .append_message(&conversation.id, &NewMessage::assistant("a"))
            .await
            .unwrap();

        let texts: Vec<_> = sync
            .list_messages(&conversation.id)
            .await
            .into_iter()
            .map(|m| (m.text, m.role))
            .collect();
        assert_eq!(
            texts,
            vec![
                ("q".to_string(), Role::User),
                ("offline".to_string(), Role::User),
                ("a".to_string(), Role::Assistant),
            ]
        );
    }

    #[tokio::test]
    async fn test_update_validates_before_any_io() {
        let sync = synchronizer();
        let conversation = sync.create("chat").await;
        let before = sync.remote().calls();

        let result = sync
            .update(&conversation.id, &ConversationPatch::title(" "))
            .await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(sync.remote().calls(), before);
    }

    #[tokio::test]
    async fn test_update_falls_back_to_local_patch() {
        let sync = synchronizer();
        let conversation = sync.create("chat").await;
        sync.remote().set_down(true);

        let updated = sync
            .update(&conversation.id, &ConversationPatch::title("renamed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "renamed");
        assert!(updated.updated_at >= conversation.updated_at);
        assert_eq!(
            sync.local().get_conversation(&conversation.id).unwrap().title,
            "renamed"
        );
        assert!(sync.update("missing", &ConversationPatch::title("x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_always_clears_local_copy() {
        let sync = synchronizer();
        let conversation = sync.create("chat").await;
        sync.append_message(&conversation.id, NewMessage::user("x"))
            .await
            .unwrap();
        sync.remote().set_down(true);

        sync.delete(&conversation.id).await;
        assert!(sync.local().get_conversation(&conversation.id).is_none());
        assert!(sync.local().list_messages(&conversation.id).is_empty());
        assert!(sync.last_remote_error().is_some());
    }

    #[test]
    fn test_merge_drops_messages_deleted_remotely() {
        let mut kept = Message::new_local("c", NewMessage::user("kept"));
        kept.local_only = false;
        let mut gone = Message::new_local("c", NewMessage::user("gone"));
        gone.local_only = false;

        let merged = merge_messages(vec![kept.clone(), gone], vec![kept.clone()]);
        assert_eq!(merged, vec![kept]);
    }
}

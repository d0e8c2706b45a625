//! Chat orchestrator: one active conversation, at most one live stream

use murmur_store::{
    Conversation, ConversationApi, ConversationPatch, Message, NewMessage, Synchronizer,
};
use murmur_stream::{
    Failure, SessionEvent, SessionEventKind, SessionHandle, SessionId, StreamController,
    TextPolicy,
};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;
use crate::events::{ChatEvent, ChatSnapshot, ConnectionState};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Title of conversations created with `new_conversation`
    pub default_title: String,
    /// In-memory assistant greeting shown on an empty conversation
    pub greeting: Option<String>,
    /// Length of titles derived from a first message
    pub title_max_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_title: "New conversation".to_string(),
            greeting: Some(
                "Hi! I'm your coding assistant. Ask me anything about programming.".to_string(),
            ),
            title_max_chars: 30,
        }
    }
}

/// The turn whose stream is currently live
struct ActiveTurn {
    handle: SessionHandle,
    conversation_id: String,
    placeholder_id: String,
    payload: String,
    received: String,
}

/// A turn that exhausted its attempts before receiving any text
struct FailedTurn {
    conversation_id: String,
    placeholder_id: String,
    payload: String,
}

/// Top-level chat coordinator.
///
/// A single-owner actor: every operation takes `&mut self`. Session callbacks
/// are queued on an internal channel tagged with their session id and applied
/// by [`handle_session_event`](Self::handle_session_event); anything from a
/// session other than the active one is dropped.
pub struct ChatOrchestrator<R> {
    config: ChatConfig,
    sync: Synchronizer<R>,
    controller: StreamController,
    turn: Option<ActiveTurn>,
    failed_turn: Option<FailedTurn>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    event_tx: broadcast::Sender<ChatEvent>,

    current_conversation_id: Option<String>,
    messages: Vec<Message>,
    is_loading: bool,
    connection: ConnectionState,
    conversations: Vec<Conversation>,
}

impl<R: ConversationApi> ChatOrchestrator<R> {
    pub fn new(config: ChatConfig, sync: Synchronizer<R>, controller: StreamController) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            sync,
            controller,
            turn: None,
            failed_turn: None,
            session_tx,
            session_rx,
            event_tx,
            current_conversation_id: None,
            messages: Vec::new(),
            is_loading: false,
            connection: ConnectionState::default(),
            conversations: Vec::new(),
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            current_conversation_id: self.current_conversation_id.clone(),
            messages: self.messages.clone(),
            is_loading: self.is_loading,
            connection: self.connection.clone(),
            conversations: self.conversations.clone(),
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn synchronizer(&self) -> &Synchronizer<R> {
        &self.sync
    }

    pub fn current_conversation_id(&self) -> Option<&str> {
        self.current_conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Id of the live session, if a turn is streaming
    pub fn active_session(&self) -> Option<SessionId> {
        self.turn.as_ref().map(|t| t.handle.id())
    }

    /// Whether `force_reconnect` would re-open a failed turn
    pub fn can_retry(&self) -> bool {
        self.failed_turn.is_some()
    }

    /// Load the conversation list and open the most recent conversation,
    /// or a fresh one when there is none.
    pub async fn load(&mut self) {
        self.refresh_conversations().await;
        match self.conversations.first().map(|c| c.id.clone()) {
            Some(id) => self.select_conversation(&id).await,
            None => {
                self.new_conversation().await;
            }
        }
    }

    /// Send a user message and stream the assistant's reply.
    ///
    /// Returns `Ok(false)` without doing anything when `text` is blank or a
    /// turn is already streaming.
    pub async fn send_message(&mut self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        if self.is_loading {
            tracing::debug!("Send ignored, a turn is already streaming");
            return Ok(false);
        }
        self.failed_turn = None;

        let conversation_id = match &self.current_conversation_id {
            Some(id) => id.clone(),
            None => {
                let conversation = self.sync.create(&self.title_for(text)).await;
                self.activate(conversation.id.clone());
                self.refresh_conversations().await;
                conversation.id
            }
        };

        let saved = self
            .sync
            .append_message(&conversation_id, NewMessage::user(text))
            .await?;
        self.messages.push(saved);

        let placeholder = Message::new_local(&conversation_id, NewMessage::assistant(""));
        let placeholder_id = placeholder.id.clone();
        self.messages.push(placeholder);
        self.emit(ChatEvent::MessagesChanged);

        self.start_turn(conversation_id, placeholder_id, text.to_string());
        Ok(true)
    }

    /// Close any live stream and show the saved messages of `id`
    pub async fn select_conversation(&mut self, id: &str) {
        self.close_turn();
        self.failed_turn = None;

        let mut messages = self.sync.list_messages(id).await;
        if messages.is_empty() {
            messages.extend(self.greeting(id));
        }
        self.messages = messages;
        self.activate(id.to_string());
        self.emit(ChatEvent::MessagesChanged);
    }

    /// Close any live stream and start an empty conversation
    pub async fn new_conversation(&mut self) -> Conversation {
        self.close_turn();
        self.failed_turn = None;

        let conversation = self.sync.create(&self.config.default_title).await;
        self.messages = self.greeting(&conversation.id).into_iter().collect();
        self.activate(conversation.id.clone());
        self.emit(ChatEvent::MessagesChanged);
        self.refresh_conversations().await;
        conversation
    }

    /// Delete a conversation; deleting the active one moves to a fresh one
    pub async fn delete_conversation(&mut self, id: &str) {
        self.sync.delete(id).await;
        if self.current_conversation_id.as_deref() == Some(id) {
            self.new_conversation().await;
        } else {
            self.refresh_conversations().await;
        }
    }

    /// Rename a conversation. A blank title is rejected.
    pub async fn rename_conversation(
        &mut self,
        id: &str,
        title: &str,
    ) -> Result<Option<Conversation>> {
        let updated = self
            .sync
            .update(id, &ConversationPatch::title(title.trim()))
            .await?;
        self.refresh_conversations().await;
        Ok(updated)
    }

    /// Reconnect the live stream from attempt 1, keeping received text, or
    /// re-open the last turn if it failed without output.
    ///
    /// Returns whether anything was restarted.
    pub fn force_reconnect(&mut self) -> bool {
        if let Some(turn) = &self.turn {
            turn.handle.force_reconnect(TextPolicy::KeepText);
            self.connection.is_reconnecting = true;
            self.emit_connection();
            return true;
        }

        let Some(failed) = self.failed_turn.take() else {
            return false;
        };
        if self.current_conversation_id.as_deref() != Some(failed.conversation_id.as_str()) {
            return false;
        }

        tracing::debug!("Retrying failed turn in {}", failed.conversation_id);
        self.set_message_text(&failed.placeholder_id, String::new());
        self.emit(ChatEvent::MessagesChanged);
        self.start_turn(failed.conversation_id, failed.placeholder_id, failed.payload);
        true
    }

    /// Wait for the next queued session event
    pub async fn next_session_event(&mut self) -> Option<SessionEvent> {
        self.session_rx.recv().await
    }

    /// Drive queued session events until no turn is streaming
    pub async fn run_until_idle(&mut self) -> Result<()> {
        while self.turn.is_some() {
            match self.session_rx.recv().await {
                Some(event) => {
                    self.handle_session_event(event).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Apply one session event. Returns `false` if it was dropped as stale.
    pub async fn handle_session_event(&mut self, event: SessionEvent) -> Result<bool> {
        let Some(turn) = self.turn.as_mut() else {
            tracing::debug!("Dropping event from closed session {}", event.session);
            return Ok(false);
        };
        if turn.handle.id() != event.session {
            tracing::debug!("Dropping event from superseded session {}", event.session);
            return Ok(false);
        }

        match event.kind {
            SessionEventKind::Open => {
                self.connection = ConnectionState {
                    is_connected: true,
                    is_reconnecting: false,
                    last_error: None,
                };
                self.emit_connection();
            }
            SessionEventKind::Delta { text } => {
                turn.received.push_str(&text);
                let message_id = turn.placeholder_id.clone();
                let received = turn.received.clone();
                self.set_message_text(&message_id, received);
                self.emit(ChatEvent::Delta { message_id, text });
            }
            SessionEventKind::Error { user_message, .. } => self.report_failure(user_message),
            SessionEventKind::Timeout => {
                self.report_failure(Failure::TimedOut.user_message().to_string())
            }
            SessionEventKind::Reconnecting { .. } => {
                self.connection.is_connected = false;
                self.connection.is_reconnecting = true;
                self.emit_connection();
            }
            SessionEventKind::End => {
                if let Some(turn) = self.turn.take() {
                    self.finish_turn(turn).await?;
                }
            }
            SessionEventKind::MaxAttemptsExhausted => {
                if let Some(turn) = self.turn.take() {
                    self.connection.is_connected = false;
                    if turn.received.is_empty() {
                        tracing::warn!("Turn in {} failed without output", turn.conversation_id);
                        self.connection.is_reconnecting = false;
                        self.emit_connection();
                        self.failed_turn = Some(FailedTurn {
                            conversation_id: turn.conversation_id,
                            placeholder_id: turn.placeholder_id,
                            payload: turn.payload,
                        });
                        self.set_loading(false);
                    } else {
                        self.finish_turn(turn).await?;
                    }
                }
            }
        }
        Ok(true)
    }

    fn start_turn(&mut self, conversation_id: String, placeholder_id: String, payload: String) {
        self.close_turn();
        let handle = self
            .controller
            .open(conversation_id.clone(), payload.clone(), self.session_tx.clone());
        tracing::debug!("Turn in {} streaming on session {}", conversation_id, handle.id());

        self.turn = Some(ActiveTurn {
            handle,
            conversation_id,
            placeholder_id,
            payload,
            received: String::new(),
        });
        self.connection = ConnectionState::default();
        self.emit_connection();
        self.set_loading(true);
    }

    /// Persist whatever the turn received and swap it in for the placeholder
    async fn finish_turn(&mut self, turn: ActiveTurn) -> Result<()> {
        self.connection.is_reconnecting = false;
        self.emit_connection();

        let persisted = if turn.received.is_empty() {
            self.messages.retain(|m| m.id != turn.placeholder_id);
            Ok(())
        } else {
            self.sync
                .append_message(&turn.conversation_id, NewMessage::assistant(turn.received))
                .await
                .map(|saved| {
                    match self.messages.iter_mut().find(|m| m.id == turn.placeholder_id) {
                        Some(slot) => *slot = saved,
                        None => self.messages.push(saved),
                    }
                })
        };
        self.emit(ChatEvent::MessagesChanged);
        // The turn is over whether or not the reply was saved.
        self.set_loading(false);
        persisted?;

        self.refresh_conversations().await;
        Ok(())
    }

    fn close_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.handle.close();
            tracing::debug!("Closed session {}", turn.handle.id());
            self.connection.is_reconnecting = false;
            self.emit_connection();
        }
        self.set_loading(false);
    }

    /// Record a failed attempt; the notice replaces the placeholder only
    /// while nothing has been received.
    fn report_failure(&mut self, notice: String) {
        self.connection.is_connected = false;
        self.connection.last_error = Some(notice.clone());
        self.emit_connection();

        let placeholder = self
            .turn
            .as_ref()
            .filter(|t| t.received.is_empty())
            .map(|t| t.placeholder_id.clone());
        if let Some(id) = placeholder {
            self.set_message_text(&id, notice);
            self.emit(ChatEvent::MessagesChanged);
        }
    }

    async fn refresh_conversations(&mut self) {
        self.conversations = self.sync.list().await;
        self.emit(ChatEvent::ConversationsChanged);
    }

    fn activate(&mut self, conversation_id: String) {
        self.current_conversation_id = Some(conversation_id.clone());
        self.emit(ChatEvent::ConversationSelected { conversation_id });
    }

    fn greeting(&self, conversation_id: &str) -> Option<Message> {
        self.config
            .greeting
            .as_ref()
            .map(|text| Message::new_local(conversation_id, NewMessage::assistant(text.clone())))
    }

    fn title_for(&self, text: &str) -> String {
        let max = self.config.title_max_chars;
        if max == 0 {
            return self.config.default_title.clone();
        }
        let mut title: String = text.chars().take(max).collect();
        if text.chars().count() > max {
            title.push_str("...");
        }
        title
    }

    fn set_message_text(&mut self, message_id: &str, text: String) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
            message.text = text;
        }
    }

    fn set_loading(&mut self, is_loading: bool) {
        if self.is_loading != is_loading {
            self.is_loading = is_loading;
            self.emit(ChatEvent::LoadingChanged { is_loading });
        }
    }

    fn emit_connection(&self) {
        self.emit(ChatEvent::ConnectionChanged {
            state: self.connection.clone(),
        });
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.event_tx.send(event);
    }
}

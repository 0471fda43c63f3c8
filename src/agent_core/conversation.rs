//! Chat managers: the durable chat log the turn engine writes through.
//!
//! - [`InMemoryChatManager`]: vector-backed, used by tests and ephemeral
//!   sessions.
//! - [`SqliteChatManager`]: backed by [`ChatDatabase`].
//!
//! Both publish a [`MessageAdded`] event on a broadcast channel after every
//! append. Also here: [`build_chat_messages`], which turns a [`ChatState`]
//! into the request messages for the model.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::database::{ChatDatabase, ChatSummary};
use super::errors::AgentError;
use super::interfaces::ChatManager;
use super::types::{ChatState, Message, MessageAdded, MessageRole};
use crate::inference::config::ToolCallFormat;
use crate::inference::types::{ChatMessage, Role, ToolCall};

/// Capacity of the "message added" channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ─── Request building ───────────────────────────────────────────────────────

/// Build the request messages for `chat`.
///
/// The system prompt goes first. `error` messages and `system` notices are
/// display-only and never sent. Models without native tool calls get tool
/// results as `user` messages and assistant messages without `tool_calls`.
///
/// Tool calls that never got a `tool` message (the turn was stopped mid
/// cycle) are left out, since native servers reject unanswered calls.
pub fn build_chat_messages(chat: &ChatState, format: ToolCallFormat) -> Vec<ChatMessage> {
    let native = format == ToolCallFormat::NativeJson;
    let answered: HashSet<&str> = chat
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    let mut out = Vec::with_capacity(chat.messages.len() + 1);

    if let Some(prompt) = chat.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
        out.push(ChatMessage::text(Role::System, prompt));
    }

    for msg in &chat.messages {
        match msg.role {
            MessageRole::System | MessageRole::Error => {}
            MessageRole::User => out.push(ChatMessage::text(Role::User, msg.content.as_str())),
            MessageRole::Assistant => out.push(ChatMessage {
                role: Role::Assistant,
                content: Some(msg.content.clone()),
                tool_call_id: None,
                tool_calls: if native {
                    answered_calls(msg, &answered)
                } else {
                    None
                },
            }),
            MessageRole::Tool if native => out.push(ChatMessage {
                role: Role::Tool,
                content: Some(msg.content.clone()),
                tool_call_id: msg.tool_call_id.clone(),
                tool_calls: None,
            }),
            MessageRole::Tool => {
                let name = msg.tool_name.as_deref().unwrap_or("tool");
                out.push(ChatMessage::text(
                    Role::User,
                    format!("[Tool result: {name}]\n{}", msg.content),
                ));
            }
        }
    }

    out
}

fn answered_calls(msg: &Message, answered: &HashSet<&str>) -> Option<Vec<ToolCall>> {
    let calls = msg.tool_calls.as_ref()?;
    let kept: Vec<ToolCall> = calls
        .iter()
        .filter(|c| answered.contains(c.id.as_str()))
        .cloned()
        .collect();
    if kept.len() < calls.len() {
        tracing::debug!(
            timestamp = msg.timestamp,
            dropped = calls.len() - kept.len(),
            "unanswered tool calls left out of the request"
        );
    }
    (!kept.is_empty()).then_some(kept)
}

// ─── In-memory ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    chats: HashMap<String, ChatState>,
    active: Option<String>,
}

/// Chat manager that keeps everything in memory.
pub struct InMemoryChatManager {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<MessageAdded>,
    persist_delay: Duration,
    event_delay: Duration,
    publish_events: bool,
}

impl Default for InMemoryChatManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
            persist_delay: Duration::ZERO,
            event_delay: Duration::ZERO,
            publish_events: true,
        }
    }

    /// Sleep this long before each append completes.
    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    /// Publish each "message added" event this long after the append has
    /// returned.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Store messages without publishing events (handshakes will time out).
    pub fn without_events(mut self) -> Self {
        self.publish_events = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a chat and make it active.
    pub fn open_new_chat(&self, chat_id: &str, system_prompt: Option<String>) {
        let mut state = self.state();
        state.chats.insert(
            chat_id.to_string(),
            ChatState {
                chat_id: chat_id.to_string(),
                system_prompt,
                messages: Vec::new(),
            },
        );
        state.active = Some(chat_id.to_string());
    }

    pub fn close_active(&self) {
        self.state().active = None;
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.state()
            .chats
            .get(chat_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatManager for InMemoryChatManager {
    async fn active_chat_or_fail(&self) -> Result<ChatState, AgentError> {
        let state = self.state();
        state
            .active
            .as_ref()
            .and_then(|id| state.chats.get(id))
            .cloned()
            .ok_or_else(|| AgentError::ChatManager {
                reason: "no active chat".into(),
            })
    }

    async fn add_message_and_await_persisted(
        &self,
        chat_id: &str,
        message: Message,
    ) -> Result<(), AgentError> {
        if !self.persist_delay.is_zero() {
            tokio::time::sleep(self.persist_delay).await;
        }
        {
            let mut state = self.state();
            let chat = state.chats.get_mut(chat_id).ok_or_else(|| AgentError::ChatManager {
                reason: format!("chat '{chat_id}' not found"),
            })?;
            chat.messages.push(message.clone());
        }
        if !self.publish_events {
            return Ok(());
        }
        let event = MessageAdded {
            chat_id: chat_id.to_string(),
            message,
        };
        if self.event_delay.is_zero() {
            let _ = self.events.send(event);
        } else {
            let events = self.events.clone();
            let delay = self.event_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(event);
            });
        }
        Ok(())
    }

    async fn delete_messages_after(&self, chat_id: &str, index: usize) -> Result<bool, AgentError> {
        let mut state = self.state();
        match state.chats.get_mut(chat_id) {
            Some(chat) if index < chat.messages.len() => {
                chat.messages.truncate(index + 1);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageAdded> {
        self.events.subscribe()
    }
}

// ─── SQLite ─────────────────────────────────────────────────────────────────

/// Chat manager persisting to SQLite.
pub struct SqliteChatManager {
    db: Mutex<ChatDatabase>,
    active: Mutex<Option<String>>,
    events: broadcast::Sender<MessageAdded>,
}

impl SqliteChatManager {
    pub fn new(db: ChatDatabase) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db: Mutex::new(db),
            active: Mutex::new(None),
            events,
        }
    }

    fn db(&self) -> MutexGuard<'_, ChatDatabase> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a chat with a fresh id and make it active.
    pub fn new_chat(&self, title: &str, system_prompt: Option<&str>) -> Result<String, AgentError> {
        let chat_id = uuid::Uuid::new_v4().to_string();
        self.db().create_chat(&chat_id, title, system_prompt)?;
        *self.active() = Some(chat_id.clone());
        tracing::info!(%chat_id, "chat created");
        Ok(chat_id)
    }

    /// Make an existing chat active.
    pub fn open_chat(&self, chat_id: &str) -> Result<(), AgentError> {
        if self.db().get_chat(chat_id)?.is_none() {
            return Err(AgentError::ChatManager {
                reason: format!("chat '{chat_id}' not found"),
            });
        }
        *self.active() = Some(chat_id.to_string());
        Ok(())
    }

    pub fn active_chat_id(&self) -> Option<String> {
        self.active().clone()
    }

    pub fn list_chats(&self) -> Result<Vec<ChatSummary>, AgentError> {
        self.db().list_chats()
    }

    pub fn chat_messages(&self, chat_id: &str) -> Result<Vec<Message>, AgentError> {
        self.db().get_messages(chat_id)
    }

    pub fn chat_title(&self, chat_id: &str) -> Result<Option<String>, AgentError> {
        Ok(self.db().get_chat(chat_id)?.map(|c| c.title))
    }

    pub fn rename_chat(&self, chat_id: &str, title: &str) -> Result<(), AgentError> {
        self.db().rename_chat(chat_id, title)
    }

    /// Delete a chat. Deleting the active chat leaves none active.
    pub fn delete_chat(&self, chat_id: &str) -> Result<(), AgentError> {
        self.db().delete_chat(chat_id)?;
        let mut active = self.active();
        if active.as_deref() == Some(chat_id) {
            *active = None;
        }
        tracing::info!(%chat_id, "chat deleted");
        Ok(())
    }
}

#[async_trait]
impl ChatManager for SqliteChatManager {
    async fn active_chat_or_fail(&self) -> Result<ChatState, AgentError> {
        let chat_id = self.active_chat_id().ok_or_else(|| AgentError::ChatManager {
            reason: "no active chat".into(),
        })?;
        let db = self.db();
        let record = db.get_chat(&chat_id)?.ok_or_else(|| AgentError::ChatManager {
            reason: format!("chat '{chat_id}' not found"),
        })?;
        Ok(ChatState {
            chat_id,
            system_prompt: record.system_prompt,
            messages: db.get_messages(&record.id)?,
        })
    }

    async fn add_message_and_await_persisted(
        &self,
        chat_id: &str,
        message: Message,
    ) -> Result<(), AgentError> {
        self.db().insert_message(chat_id, &message)?;
        let _ = self.events.send(MessageAdded {
            chat_id: chat_id.to_string(),
            message,
        });
        Ok(())
    }

    async fn delete_messages_after(&self, chat_id: &str, index: usize) -> Result<bool, AgentError> {
        self.db().delete_messages_after(chat_id, index)
    }

    fn subscribe(&self) -> broadcast::Receiver<MessageAdded> {
        self.events.subscribe()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

//! Collaborator traits the turn engine is driven through.
//!
//! The engine never owns storage, transport or display. It talks to a
//! [`ChatManager`] for the durable log, a [`StreamProvider`] for model output,
//! a [`ToolRunner`] for tool execution, a [`TextualToolCallParser`] for
//! models without native tool calls, and a [`Renderer`] for display.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::types::{ChatState, Message, MessageAdded};
use crate::inference::types::{ParsedToolCall, StreamChunk};
use crate::inference::InferenceError;

/// A boxed model response stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Durable chat log.
#[async_trait]
pub trait ChatManager: Send + Sync {
    /// The chat currently open, or an error when none is.
    async fn active_chat_or_fail(&self) -> Result<ChatState, AgentError>;

    /// Append `message` and return once it is durably stored.
    ///
    /// A [`MessageAdded`] event for it is published to subscribers
    /// asynchronously; it may arrive before or after this call returns.
    async fn add_message_and_await_persisted(
        &self,
        chat_id: &str,
        message: Message,
    ) -> Result<(), AgentError>;

    /// Drop every message after position `index`. Returns `false` when the
    /// chat or index does not exist.
    async fn delete_messages_after(&self, chat_id: &str, index: usize) -> Result<bool, AgentError>;

    /// Subscribe to "message added" events.
    fn subscribe(&self) -> broadcast::Receiver<MessageAdded>;
}

/// Source of streamed model responses.
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Open a response stream for `chat`. The provider must end the stream
    /// promptly once `cancel` fires.
    async fn generate_chat_response_stream(
        &self,
        chat: &ChatState,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, InferenceError>;
}

/// Result of a single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success { result: String },
    Failure { error: String },
}

/// Executes tools by name.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn execute_tool(&self, name: &str, args: serde_json::Value) -> ToolOutcome;
}

/// Finds tool-call syntax embedded in plain assistant text.
pub trait TextualToolCallParser: Send + Sync {
    fn parse_all(&self, text: &str) -> Vec<ParsedToolCall>;
}

/// Display surface. Calls must be cheap and must not block.
pub trait Renderer: Send + Sync {
    /// Show an empty in-progress slot for the response keyed by `timestamp`.
    fn create_placeholder(&self, timestamp: i64);

    /// Put the placeholder back into its "thinking" state.
    fn set_thinking(&self, timestamp: i64);

    /// Replace the placeholder's body with the text streamed so far.
    fn render_progressive(&self, timestamp: i64, text: &str);

    fn remove_placeholder(&self, timestamp: i64);

    /// Render a message confirmed by the chat manager.
    fn render_message(&self, message: &Message);

    /// Transient user-facing notice (not stored).
    fn notify(&self, text: &str);

    /// Toggle the busy indicator and the stop control.
    fn set_busy(&self, busy: bool);

    /// Ask whether `count` later messages may be discarded.
    fn confirm_discard(&self, count: usize) -> bool;
}

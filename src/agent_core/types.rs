//! Shared types for the agent core.
//!
//! Chat messages as the chat manager stores them, per-turn working state,
//! and the outcome/phase values the turn engine reports.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::inference::types::ToolCall;

// ─── Messages ───────────────────────────────────────────────────────────────

/// Who produced a message in the chat log.
///
/// `Error` messages are shown to the user but never sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Error,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Error => "error",
            MessageRole::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "error" => Some(MessageRole::Error),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

/// A single entry in the chat log.
///
/// `timestamp` comes from the owning orchestrator's [`LogicalClock`] and is
/// unique within it; it doubles as the handshake correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::User, content, timestamp)
    }

    pub fn assistant(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::Assistant, content, timestamp)
    }

    pub fn system(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::System, content, timestamp)
    }

    pub fn error(content: impl Into<String>, timestamp: i64) -> Self {
        Self::new(MessageRole::Error, content, timestamp)
    }

    /// The result of one tool call.
    pub fn tool_result(
        content: impl Into<String>,
        timestamp: i64,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::new(MessageRole::Tool, content, timestamp)
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    /// Identity used for de-duplicating "message added" events.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.timestamp,
            role: self.role,
        }
    }
}

/// Unique identity of a message within one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub timestamp: i64,
    pub role: MessageRole,
}

/// Snapshot of the active chat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    pub chat_id: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
}

/// Emitted by the chat manager after a message has been appended.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAdded {
    pub chat_id: String,
    pub message: Message,
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// Working state for one iteration of the turn loop.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub index: u32,
    /// Timestamp of the assistant response this turn produces.
    pub timestamp: i64,
    pub accumulated_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub used_textual_fallback: bool,
}

impl TurnState {
    pub fn new(index: u32, timestamp: i64) -> Self {
        Self {
            index,
            timestamp,
            ..Default::default()
        }
    }
}

/// The in-progress display slot for a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderHandle {
    pub timestamp: i64,
}

/// How a `send_message` or `regenerate` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a final answer (or empty-response notice).
    Completed { turns: u32 },
    /// The loop hit `max_turns` while the model still wanted tools.
    TurnLimitReached { turns: u32 },
    /// Cancelled by the user, or a regeneration the user declined.
    Stopped,
    /// An error was recorded in the chat as an `error` message.
    Failed { reason: String },
}

/// Observable state of the turn engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Streaming,
    Resolving,
    ExecutingTools,
    Finalizing,
    Aborted,
    Failed,
}

// ─── Logical Clock ──────────────────────────────────────────────────────────

/// Strictly increasing millisecond timestamps.
///
/// Returns `max(now_ms, last + 1)` so two messages created in the same
/// millisecond still get distinct keys.
#[derive(Debug, Default)]
pub struct LogicalClock {
    last: AtomicI64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start after `floor` so keys never collide with already stored messages.
    pub fn starting_after(floor: i64) -> Self {
        Self {
            last: AtomicI64::new(floor),
        }
    }

    pub fn next(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Never hand out a value at or below `floor` again.
    pub fn observe(&self, floor: i64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

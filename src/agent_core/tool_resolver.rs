//! Decides which tool calls a finished stream asked for.
//!
//! Native calls always win and the textual parser is then never consulted.
//! Otherwise the text is scanned once; calls found there get synthetic ids
//! and the text is kept unchanged in history.

use super::interfaces::TextualToolCallParser;
use super::types::{Message, TurnState};
use crate::inference::types::{ChatMessage, ToolCall};

/// Where the resolved tool calls came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Native,
    Textual,
    NoTools,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub tool_calls: Vec<ToolCall>,
    /// The assistant message to append to history.
    pub assistant_message: Message,
    pub strategy: ResolutionStrategy,
}

impl Resolution {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Resolve tool calls for the turn described by `turn`.
///
/// `native_message` is accepted for its shape only: the persisted content is
/// always the full accumulated text and the tool calls are always the native
/// list.
pub fn resolve(
    native_calls: Vec<ToolCall>,
    native_message: Option<&ChatMessage>,
    turn: &TurnState,
    parser: &dyn TextualToolCallParser,
) -> Resolution {
    let text = turn.accumulated_text.as_str();

    if !native_calls.is_empty() {
        if let Some(msg) = native_message {
            tracing::trace!(
                carried = msg.tool_calls.as_ref().map_or(0, Vec::len),
                "native assistant message superseded by accumulated state"
            );
        }
        let assistant_message =
            Message::assistant(text, turn.timestamp).with_tool_calls(native_calls.clone());
        return Resolution {
            tool_calls: native_calls,
            assistant_message,
            strategy: ResolutionStrategy::Native,
        };
    }

    let parsed = parser.parse_all(text);
    if !parsed.is_empty() {
        let tool_calls: Vec<ToolCall> = parsed
            .into_iter()
            .enumerate()
            .map(|(i, p)| ToolCall::function(format!("texttool-{}-{i}", turn.timestamp), p.name, p.arguments))
            .collect();
        tracing::info!(
            turn = turn.index,
            count = tool_calls.len(),
            "tool calls recovered from text"
        );
        let assistant_message =
            Message::assistant(text, turn.timestamp).with_tool_calls(tool_calls.clone());
        return Resolution {
            tool_calls,
            assistant_message,
            strategy: ResolutionStrategy::Textual,
        };
    }

    Resolution {
        tool_calls: Vec::new(),
        assistant_message: Message::assistant(text, turn.timestamp),
        strategy: ResolutionStrategy::NoTools,
    }
}

//! Drains one model response stream into a [`TurnState`].

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::interfaces::{ChunkStream, Renderer};
use super::types::TurnState;
use super::view::PlaceholderSlot;
use crate::inference::types::{ChatMessage, StreamChunk, ToolCall};

/// What the stream produced besides text.
#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub native_tool_calls: Vec<ToolCall>,
    pub native_message: Option<ChatMessage>,
}

/// Consume `stream` until `Done`, end of stream, an error chunk, or
/// cancellation.
///
/// Text is appended to `turn.accumulated_text` as it arrives, so a caller
/// still holds the partial text after an abort. Progressive rendering only
/// happens while the live placeholder belongs to this turn.
pub async fn consume(
    mut stream: ChunkStream,
    turn: &mut TurnState,
    placeholder: &PlaceholderSlot,
    renderer: &dyn Renderer,
    cancel: &CancellationToken,
) -> Result<StreamOutcome, AgentError> {
    let mut outcome = StreamOutcome::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Aborted),
            chunk = stream.next() => chunk,
        };
        if cancel.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        match next {
            None | Some(StreamChunk::Done) => break,
            Some(StreamChunk::Error { error }) => {
                tracing::warn!(turn = turn.index, error = %error, "stream reported an error");
                return Err(AgentError::Stream { reason: error });
            }
            Some(StreamChunk::Content { text }) => {
                turn.accumulated_text.push_str(&text);
                if placeholder.is_active(turn.timestamp) {
                    renderer.render_progressive(turn.timestamp, &turn.accumulated_text);
                }
            }
            Some(StreamChunk::ToolCalls {
                calls,
                assistant_message,
            }) => {
                tracing::debug!(turn = turn.index, count = calls.len(), "native tool calls received");
                outcome.native_tool_calls.extend(calls);
                if let Some(lead_in) = assistant_message
                    .as_ref()
                    .and_then(|m| m.content.as_deref())
                    .filter(|c| !c.trim().is_empty())
                {
                    if !turn.accumulated_text.ends_with(lead_in) {
                        turn.accumulated_text.push_str(lead_in);
                    }
                }
                outcome.native_message = assistant_message;
            }
        }
    }

    Ok(outcome)
}

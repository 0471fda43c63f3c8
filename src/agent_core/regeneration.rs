//! Re-answer an earlier user message.
//!
//! History after the chosen user message is discarded (with the user's
//! consent) and a single response is streamed in its place. Tool calls are
//! not executed here; the streamed text is the answer.

use super::context::TurnContext;
use super::errors::AgentError;
use super::session::SessionGuard;
use super::turn_controller::{begin_session, conclude, finalize, observe_history, stream_turn};
use super::types::{MessageRole, TurnOutcome, TurnPhase, TurnState};

/// Regenerate the answer to the user message at `user_message_index`.
pub async fn regenerate(
    ctx: &TurnContext,
    user_message_index: usize,
) -> Result<TurnOutcome, AgentError> {
    let session = begin_session(ctx)?;
    let chat = ctx.chat_manager.active_chat_or_fail().await?;
    let chat_id = chat.chat_id.clone();

    match chat.messages.get(user_message_index) {
        Some(m) if m.role == MessageRole::User => {}
        Some(m) => {
            return Err(AgentError::InvalidRegenerationTarget {
                index: user_message_index,
                reason: format!("message is a {} message, not a user message", m.role.as_str()),
            })
        }
        None => {
            return Err(AgentError::InvalidRegenerationTarget {
                index: user_message_index,
                reason: format!("chat has {} messages", chat.messages.len()),
            })
        }
    }

    let later = chat.messages.len() - user_message_index - 1;
    if later > 0 {
        if !ctx.renderer.confirm_discard(later) {
            tracing::info!(%chat_id, later, "regeneration declined");
            return Ok(TurnOutcome::Stopped);
        }
        if !ctx
            .chat_manager
            .delete_messages_after(&chat_id, user_message_index)
            .await?
        {
            return Err(AgentError::ChatManager {
                reason: format!(
                    "could not delete messages after index {user_message_index} in chat '{chat_id}'"
                ),
            });
        }
    }
    observe_history(ctx, &chat);

    tracing::info!(%chat_id, index = user_message_index, discarded = later, "regenerating response");
    let mut turn = TurnState::new(0, ctx.clock.next());
    let result = regenerate_once(ctx, &session, &chat_id, &mut turn).await;
    let outcome = conclude(ctx, &session, &chat_id, result, Some(&turn)).await;
    drop(session);
    ctx.set_phase(TurnPhase::Idle);
    Ok(outcome)
}

async fn regenerate_once(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    turn: &mut TurnState,
) -> Result<TurnOutcome, AgentError> {
    stream_turn(ctx, session, turn).await?;
    finalize(ctx, session, chat_id, turn).await?;
    Ok(TurnOutcome::Completed { turns: 1 })
}

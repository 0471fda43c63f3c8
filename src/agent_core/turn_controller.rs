//! The bounded agent loop behind `send_message`.
//!
//! One user message drives up to `max_turns` streamed responses. Each turn
//! streams, resolves tool calls and either runs them and loops, or persists
//! the final answer and stops. Every exit path writes one explanatory
//! message and releases the session.

use super::context::TurnContext;
use super::errors::AgentError;
use super::interfaces::ChunkStream;
use super::session::SessionGuard;
use super::stream_consumer::{self, StreamOutcome};
use super::tool_execution;
use super::tool_resolver::{self, ResolutionStrategy};
use super::types::{ChatState, Message, TurnOutcome, TurnPhase, TurnState};

pub const STOPPED_NOTICE: &str = "Message generation stopped.";
pub const EMPTY_RESPONSE_NOTICE: &str = "Assistant provided an empty response.";
pub const BUSY_NOTICE: &str = "A response is already being generated. Stop it or wait for it to finish.";

pub fn turn_limit_notice(max_turns: u32) -> String {
    format!("Maximum number of turns ({max_turns}) reached. Stopping automatic tool calls.")
}

/// Send `input` as a user message and run the agent loop.
///
/// Returns `Err` only when nothing was started: empty input, a session
/// already in flight, or no active chat. Everything else is recorded in the
/// chat and reported through [`TurnOutcome`].
pub async fn send_message(ctx: &TurnContext, input: &str) -> Result<TurnOutcome, AgentError> {
    if input.trim().is_empty() {
        return Err(AgentError::EmptyInput);
    }
    let session = begin_session(ctx)?;
    let chat = ctx.chat_manager.active_chat_or_fail().await?;
    observe_history(ctx, &chat);
    let chat_id = chat.chat_id;

    tracing::info!(%chat_id, chars = input.len(), "user message received");
    let result = run_turns(ctx, &session, &chat_id, input).await;
    let outcome = conclude(ctx, &session, &chat_id, result, None).await;
    drop(session);
    ctx.set_phase(TurnPhase::Idle);
    Ok(outcome)
}

async fn run_turns(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    input: &str,
) -> Result<TurnOutcome, AgentError> {
    let user = Message::user(input, ctx.clock.next());
    ctx.persist_soft(session, chat_id, user, "user message").await?;

    let max_turns = ctx.config.max_turns.max(1);
    for index in 0..max_turns {
        if session.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        let mut turn = TurnState::new(index, ctx.clock.next());
        let streamed = stream_turn(ctx, session, &mut turn).await?;

        ctx.set_phase(TurnPhase::Resolving);
        let resolution = tool_resolver::resolve(
            streamed.native_tool_calls,
            streamed.native_message.as_ref(),
            &turn,
            ctx.parser.as_ref(),
        );
        turn.used_textual_fallback = resolution.strategy == ResolutionStrategy::Textual;
        turn.tool_calls = resolution.tool_calls.clone();

        if !resolution.has_tool_calls() {
            finalize(ctx, session, chat_id, &turn).await?;
            return Ok(TurnOutcome::Completed { turns: index + 1 });
        }

        tracing::info!(
            turn = index,
            timestamp = turn.timestamp,
            calls = turn.tool_calls.len(),
            textual = turn.used_textual_fallback,
            "running tool cycle"
        );
        let report = tool_execution::execute_tool_calls(
            ctx,
            session,
            chat_id,
            &resolution.tool_calls,
            resolution.assistant_message,
        )
        .await?;
        tracing::debug!(turn = index, ?report, "tool cycle finished");
    }

    tracing::warn!(max_turns, "turn limit reached with tool calls still pending");
    ctx.placeholder.clear(ctx.renderer.as_ref());
    let notice = Message::system(turn_limit_notice(max_turns), ctx.clock.next());
    ctx.persist_notice(chat_id, notice, "turn limit notice").await;
    Ok(TurnOutcome::TurnLimitReached { turns: max_turns })
}

/// Show the placeholder, re-read the chat and drain one response into `turn`.
pub(crate) async fn stream_turn(
    ctx: &TurnContext,
    session: &SessionGuard,
    turn: &mut TurnState,
) -> Result<StreamOutcome, AgentError> {
    ctx.placeholder.show(ctx.renderer.as_ref(), turn.timestamp);

    let chat = ctx.chat_manager.active_chat_or_fail().await?;
    observe_history(ctx, &chat);

    ctx.set_phase(TurnPhase::Streaming);
    tracing::debug!(
        turn = turn.index,
        timestamp = turn.timestamp,
        history = chat.messages.len(),
        "opening response stream"
    );
    let stream = open_stream(ctx, session, &chat).await?;
    stream_consumer::consume(
        stream,
        turn,
        &ctx.placeholder,
        ctx.renderer.as_ref(),
        session.token(),
    )
    .await
}

async fn open_stream(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat: &ChatState,
) -> Result<ChunkStream, AgentError> {
    let token = session.token();
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AgentError::Aborted),
        opened = ctx.provider.generate_chat_response_stream(chat, token.child_token()) => {
            opened.map_err(AgentError::from)
        }
    }
}

/// Persist the final answer of a turn, or the empty-response notice.
pub(crate) async fn finalize(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    turn: &TurnState,
) -> Result<(), AgentError> {
    ctx.set_phase(TurnPhase::Finalizing);
    let message = if turn.accumulated_text.trim().is_empty() {
        tracing::info!(turn = turn.index, "empty assistant response");
        Message::system(EMPTY_RESPONSE_NOTICE, turn.timestamp)
    } else {
        Message::assistant(turn.accumulated_text.as_str(), turn.timestamp)
    };
    ctx.persist_soft(session, chat_id, message, "final assistant message").await?;
    ctx.placeholder.clear_if(ctx.renderer.as_ref(), turn.timestamp);
    Ok(())
}

/// Claim the session slot, telling the user when it is already taken.
pub(crate) fn begin_session(ctx: &TurnContext) -> Result<SessionGuard, AgentError> {
    ctx.session
        .try_begin(ctx.renderer.clone())
        .inspect_err(|_| ctx.renderer.notify(BUSY_NOTICE))
}

/// Keep the clock ahead of everything already in the chat.
pub(crate) fn observe_history(ctx: &TurnContext, chat: &ChatState) {
    if let Some(max) = chat.messages.iter().map(|m| m.timestamp).max() {
        ctx.clock.observe(max);
    }
}

/// Turn the loop's result into the closing chat entry and outcome.
///
/// `salvage` holds a partially streamed turn whose text is kept as an
/// assistant message when the user stopped generation.
pub(crate) async fn conclude(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    result: Result<TurnOutcome, AgentError>,
    salvage: Option<&TurnState>,
) -> TurnOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(AgentError::Aborted) => {
            ctx.set_phase(TurnPhase::Aborted);
            let rejected = session.reject_pending(&ctx.handshake, STOPPED_NOTICE);
            tracing::info!(%chat_id, rejected, "generation stopped by user");

            if let Some(turn) = salvage.filter(|t| !t.accumulated_text.trim().is_empty()) {
                let partial = Message::assistant(turn.accumulated_text.as_str(), turn.timestamp);
                ctx.persist_notice(chat_id, partial, "partial assistant message").await;
            }
            ctx.placeholder.clear(ctx.renderer.as_ref());

            let notice = Message::system(STOPPED_NOTICE, ctx.clock.next());
            ctx.persist_notice(chat_id, notice, "stopped notice").await;
            TurnOutcome::Stopped
        }
        Err(e) => {
            ctx.set_phase(TurnPhase::Failed);
            ctx.placeholder.clear(ctx.renderer.as_ref());
            let reason = e.to_string();
            let rejected = session.reject_pending(&ctx.handshake, &reason);
            tracing::error!(%chat_id, error = %reason, rejected, "turn failed");

            let message = Message::error(reason.as_str(), ctx.clock.next());
            ctx.persist_notice(chat_id, message, "error message").await;
            TurnOutcome::Failed { reason }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent_core::conversation::build_chat_messages;
    use crate::agent_core::test_support::{text, Harness, RenderEvent, Script, CHAT_ID};
    use crate::agent_core::types::MessageRole;
    use crate::inference::config::ToolCallFormat;
    use crate::inference::types::{ChatMessage, Role, StreamChunk, ToolCall};

    fn native_calls(calls: Vec<ToolCall>) -> StreamChunk {
        StreamChunk::ToolCalls {
            calls,
            assistant_message: Some(ChatMessage::text(Role::Assistant, "")),
        }
    }

    fn roles(messages: &[Message]) -> Vec<MessageRole> {
        messages.iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn test_plain_answer_is_concatenated() {
        let h = Harness::builder()
            .chunks(vec![text("2 + 2"), text(" = "), text("4"), StreamChunk::Done])
            .build();

        let outcome = h.orchestrator.send_message("What is 2+2?").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 1 });
        let messages = h.messages();
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(messages[1].content, "2 + 2 = 4");
        assert!(messages[1].timestamp > messages[0].timestamp);
        assert_eq!(h.ctx.placeholder.active(), None);
        assert_eq!(h.ctx.handshake.pending_count(), 0);
        assert!(!h.orchestrator.is_busy());
        assert_eq!(h.orchestrator.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_native_tool_call_then_answer() {
        let call = ToolCall::function("n1", "calc", r#"{"expr":"2+2"}"#);
        let h = Harness::builder()
            .tool_result("calc", "4")
            .chunks(vec![native_calls(vec![call.clone()]), StreamChunk::Done])
            .chunks(vec![text("The answer is 4."), StreamChunk::Done])
            .build();

        let outcome = h.orchestrator.send_message("2+2 with the calculator").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 2 });
        let messages = h.messages();
        assert_eq!(
            roles(&messages),
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::Tool,
                MessageRole::Assistant
            ]
        );
        assert_eq!(messages[1].tool_calls, Some(vec![call]));
        assert_eq!(messages[2].content, "4");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("n1"));
        assert_eq!(messages[3].content, "The answer is 4.");

        // The second request sees the tool result.
        let requests = h.provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_textual_tool_call_runs_and_loops() {
        let h = Harness::builder()
            .format(ToolCallFormat::Bracket)
            .tool_result("system.current_time", "12:00")
            .chunks(vec![text("[system.current_time()]"), StreamChunk::Done])
            .chunks(vec![text("It is noon."), StreamChunk::Done])
            .build();

        h.orchestrator.send_message("time?").await.unwrap();

        let messages = h.messages();
        assert_eq!(messages[1].content, "[system.current_time()]");
        let id = messages[1].tool_calls.as_ref().unwrap()[0].id.clone();
        assert!(id.starts_with("texttool-"));
        assert_eq!(messages[2].tool_call_id, Some(id));
        assert_eq!(messages.last().unwrap().content, "It is noon.");
    }

    #[tokio::test]
    async fn test_malformed_arguments_reported_and_loop_continues() {
        let call = ToolCall::function("n1", "calc", "{\"expr\": ");
        let h = Harness::builder()
            .tool_result("calc", "4")
            .chunks(vec![native_calls(vec![call]), StreamChunk::Done])
            .chunks(vec![text("Sorry, let me retry."), StreamChunk::Done])
            .build();

        let outcome = h.orchestrator.send_message("2+2").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 2 });
        let messages = h.messages();
        assert!(messages[2].content.starts_with("Error parsing args for calc: "));
        assert!(h.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_empty_stream_gives_one_system_notice() {
        let h = Harness::builder().chunks(vec![StreamChunk::Done]).build();

        let outcome = h.orchestrator.send_message("hello").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 1 });
        let messages = h.messages();
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::System]);
        assert_eq!(messages[1].content, EMPTY_RESPONSE_NOTICE);
        assert_eq!(h.ctx.placeholder.active(), None);
    }

    #[tokio::test]
    async fn test_turn_limit_stops_with_one_notice() {
        let call = || native_calls(vec![ToolCall::function("n", "calc", "{}")]);
        let h = Harness::builder()
            .max_turns(2)
            .tool_result("calc", "4")
            .chunks(vec![call(), StreamChunk::Done])
            .chunks(vec![call(), StreamChunk::Done])
            .chunks(vec![call(), StreamChunk::Done])
            .build();

        let outcome = h.orchestrator.send_message("loop").await.unwrap();

        assert_eq!(outcome, TurnOutcome::TurnLimitReached { turns: 2 });
        assert_eq!(h.provider.request_count(), 2);
        let notices: Vec<_> = h
            .messages()
            .into_iter()
            .filter(|m| m.role == MessageRole::System)
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].content, turn_limit_notice(2));
        assert_eq!(h.ctx.placeholder.active(), None);
    }

    #[tokio::test]
    async fn test_cancel_after_partial_text() {
        let h = Harness::builder().script(Script::Stall(vec![text("Hel")])).build();

        let (outcome, _) = tokio::join!(h.orchestrator.send_message("hi"), async {
            h.renderer.wait_for_progressive().await;
            assert!(h.orchestrator.stop());
        });

        assert_eq!(outcome.unwrap(), TurnOutcome::Stopped);
        let messages = h.messages();
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::System]);
        assert_eq!(messages[1].content, STOPPED_NOTICE);
        assert_eq!(h.ctx.placeholder.active(), None);
        assert_eq!(h.ctx.handshake.pending_count(), 0);
        assert_eq!(h.renderer.events().last(), Some(&RenderEvent::Busy(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_handshake_wait_returns_promptly() {
        let h = Harness::builder()
            .silent_chat(Duration::from_secs(10))
            .notice_timeout(Duration::from_millis(500))
            .build();
        let started = tokio::time::Instant::now();

        let (outcome, _) = tokio::join!(h.orchestrator.send_message("hi"), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(h.orchestrator.stop());
        });

        assert_eq!(outcome.unwrap(), TurnOutcome::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.provider.request_count(), 0);
        let messages = h.messages();
        assert_eq!(roles(&messages), vec![MessageRole::User, MessageRole::System]);
        assert_eq!(messages[1].content, STOPPED_NOTICE);
        assert_eq!(h.ctx.handshake.pending_count(), 0);
        assert!(!h.orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_stop_during_tool_execution() {
        let calls = vec![
            ToolCall::function("n1", "slow", "{}"),
            ToolCall::function("n2", "calc", "{}"),
        ];
        let h = Harness::builder()
            .stalling_tool("slow")
            .tool_result("calc", "4")
            .chunks(vec![native_calls(calls), StreamChunk::Done])
            .build();

        let (outcome, _) = tokio::join!(h.orchestrator.send_message("run both"), async {
            h.runner.wait_for_stall().await;
            assert!(h.orchestrator.stop());
        });

        assert_eq!(outcome.unwrap(), TurnOutcome::Stopped);
        let messages = h.messages();
        assert_eq!(
            roles(&messages),
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::System]
        );
        assert_eq!(messages[2].content, STOPPED_NOTICE);
        assert_eq!(h.runner.invocations().len(), 1);
        assert_eq!(h.provider.request_count(), 1);
        assert_eq!(h.ctx.placeholder.active(), None);
        assert_eq!(h.ctx.handshake.pending_count(), 0);

        // The unanswered calls are not sent back to the model.
        let chat = ChatState {
            chat_id: CHAT_ID.into(),
            system_prompt: None,
            messages,
        };
        let request = build_chat_messages(&chat, ToolCallFormat::NativeJson);
        assert!(request.iter().all(|m| m.tool_calls.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_message_events_still_confirm_every_handshake() {
        let call = ToolCall::function("n1", "calc", "{}");
        let h = Harness::builder()
            .persist_delay(Duration::from_millis(20))
            .event_delay(Duration::from_millis(200))
            .tool_result("calc", "4")
            .chunks(vec![native_calls(vec![call]), StreamChunk::Done])
            .chunks(vec![text("It is 4."), StreamChunk::Done])
            .build();
        let started = tokio::time::Instant::now();

        let outcome = h.orchestrator.send_message("2+2").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 2 });
        assert!(started.elapsed() < h.ctx.config.handshake_timeout);
        assert_eq!(
            h.renderer.rendered_contents(),
            vec!["2+2".to_string(), String::new(), "4".to_string(), "It is 4.".to_string()]
        );
        assert_eq!(h.ctx.handshake.pending_count(), 0);
        assert_eq!(h.ctx.placeholder.active(), None);
    }

    #[tokio::test]
    async fn test_stream_error_is_recorded() {
        let h = Harness::builder()
            .chunks(vec![text("partial"), StreamChunk::Error { error: "model crashed".into() }])
            .build();

        let outcome = h.orchestrator.send_message("hi").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Failed { reason: "model crashed".into() });
        let last = h.messages().pop().unwrap();
        assert_eq!(last.role, MessageRole::Error);
        assert_eq!(last.content, "model crashed");
        assert_eq!(h.ctx.placeholder.active(), None);
    }

    #[tokio::test]
    async fn test_provider_open_failure_is_recorded() {
        let h = Harness::builder().script(Script::OpenError("connection refused".into())).build();

        let outcome = h.orchestrator.send_message("hi").await.unwrap();

        assert!(matches!(outcome, TurnOutcome::Failed { .. }));
        assert_eq!(h.messages().pop().unwrap().role, MessageRole::Error);
    }

    #[tokio::test]
    async fn test_second_send_while_busy_is_refused() {
        let h = Harness::builder().script(Script::Stall(vec![text("...")])).build();

        let (first, _) = tokio::join!(h.orchestrator.send_message("one"), async {
            h.renderer.wait_for_progressive().await;
            let second = h.orchestrator.send_message("two").await;
            assert!(matches!(second, Err(AgentError::Busy)));
            h.orchestrator.stop();
        });

        assert_eq!(first.unwrap(), TurnOutcome::Stopped);
        assert!(h.renderer.notices().contains(&BUSY_NOTICE.to_string()));
        let users = h.messages().iter().filter(|m| m.role == MessageRole::User).count();
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let h = Harness::builder().build();
        assert!(matches!(
            h.orchestrator.send_message("   ").await,
            Err(AgentError::EmptyInput)
        ));
        assert!(h.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeouts_do_not_abort_the_loop() {
        let h = Harness::builder()
            .silent_chat(Duration::from_millis(50))
            .chunks(vec![text("fine"), StreamChunk::Done])
            .build();

        let outcome = h.orchestrator.send_message("hi").await.unwrap();

        assert_eq!(outcome, TurnOutcome::Completed { turns: 1 });
        assert_eq!(h.messages().len(), 2);
        assert_eq!(h.ctx.handshake.pending_count(), 0);
        assert_eq!(h.ctx.placeholder.active(), None);
    }
}

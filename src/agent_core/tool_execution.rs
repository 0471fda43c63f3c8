//! Runs the tool calls of one assistant turn.
//!
//! The assistant's intent is persisted first, then every call is executed in
//! order and answered with exactly one `tool` message, whether it succeeded,
//! failed, or had unparseable arguments.

use serde_json::Value;

use super::context::TurnContext;
use super::errors::AgentError;
use super::interfaces::ToolOutcome;
use super::session::SessionGuard;
use super::types::{Message, TurnPhase};
use crate::inference::types::ToolCall;

/// Counters for one tool cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCycleReport {
    pub executed: usize,
    pub failed: usize,
    pub handshake_timeouts: usize,
}

/// Persist `intent`, then execute `tool_calls` sequentially.
///
/// Cancellation is checked before each call and raced against the running
/// tool. A handshake timeout on any message is counted and the cycle
/// continues.
pub async fn execute_tool_calls(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    tool_calls: &[ToolCall],
    intent: Message,
) -> Result<ToolCycleReport, AgentError> {
    ctx.set_phase(TurnPhase::ExecutingTools);
    let mut report = ToolCycleReport::default();

    persist_counting(ctx, session, chat_id, intent, "assistant tool-call message", &mut report)
        .await?;

    for call in tool_calls {
        if session.is_cancelled() {
            return Err(AgentError::Aborted);
        }

        let name = call.function.name.as_str();
        let content = match parse_arguments(&call.function.arguments) {
            Err(reason) => {
                tracing::warn!(tool = name, %reason, "unparseable tool arguments");
                report.failed += 1;
                format!("Error parsing args for {name}: {reason}")
            }
            Ok(args) => {
                tracing::info!(tool = name, call_id = %call.id, "executing tool");
                let outcome = tokio::select! {
                    biased;
                    _ = session.token().cancelled() => return Err(AgentError::Aborted),
                    outcome = ctx.tool_runner.execute_tool(name, args) => outcome,
                };
                report.executed += 1;
                match outcome {
                    ToolOutcome::Success { result } => result,
                    ToolOutcome::Failure { error } => {
                        tracing::warn!(tool = name, %error, "tool failed");
                        report.failed += 1;
                        format!("Error executing tool {name}: {error}")
                    }
                }
            }
        };

        let message = Message::tool_result(content, ctx.clock.next(), &call.id, name);
        let context = format!("tool result {name}");
        persist_counting(ctx, session, chat_id, message, &context, &mut report).await?;
    }

    Ok(report)
}

async fn persist_counting(
    ctx: &TurnContext,
    session: &SessionGuard,
    chat_id: &str,
    message: Message,
    context: &str,
    report: &mut ToolCycleReport,
) -> Result<(), AgentError> {
    match ctx.persist(session, chat_id, message, context).await {
        Err(AgentError::HandshakeTimeout { context }) => {
            tracing::warn!(%context, "handshake timed out during tool cycle; continuing");
            report.handshake_timeouts += 1;
            Ok(())
        }
        other => other,
    }
}

/// Parse raw tool arguments. Empty input means `{}`; anything else must be
/// a JSON object.
pub fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

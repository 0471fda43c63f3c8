//! Everything a turn needs: collaborators, shared view state and tuning.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::errors::AgentError;
use super::handshake::{
    persist_with_handshake, register_and_append, HandshakeRegistry, DEFAULT_HANDSHAKE_TIMEOUT,
};
use super::interfaces::{ChatManager, Renderer, StreamProvider, TextualToolCallParser, ToolRunner};
use super::session::{SessionGuard, SessionSlot};
use super::types::{LogicalClock, Message, TurnPhase};
use super::view::PlaceholderSlot;

pub const DEFAULT_MAX_TURNS: u32 = 5;
pub const DEFAULT_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tuning for the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnConfig {
    /// Upper bound on streamed responses per user message.
    pub max_turns: u32,
    /// Deadline for each persisted message's handshake.
    pub handshake_timeout: Duration,
    /// Shorter deadline for notices written on the way out.
    pub notice_timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            notice_timeout: DEFAULT_NOTICE_TIMEOUT,
        }
    }
}

/// The injected collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub chat_manager: Arc<dyn ChatManager>,
    pub provider: Arc<dyn StreamProvider>,
    pub tool_runner: Arc<dyn ToolRunner>,
    pub parser: Arc<dyn TextualToolCallParser>,
    pub renderer: Arc<dyn Renderer>,
}

/// Shared state of one conversation view.
pub struct TurnContext {
    pub chat_manager: Arc<dyn ChatManager>,
    pub provider: Arc<dyn StreamProvider>,
    pub tool_runner: Arc<dyn ToolRunner>,
    pub parser: Arc<dyn TextualToolCallParser>,
    pub renderer: Arc<dyn Renderer>,
    pub handshake: HandshakeRegistry,
    pub placeholder: PlaceholderSlot,
    pub session: SessionSlot,
    pub clock: LogicalClock,
    pub config: TurnConfig,
    phase: Mutex<TurnPhase>,
}

impl TurnContext {
    pub fn new(collaborators: Collaborators, config: TurnConfig) -> Self {
        Self {
            chat_manager: collaborators.chat_manager,
            provider: collaborators.provider,
            tool_runner: collaborators.tool_runner,
            parser: collaborators.parser,
            renderer: collaborators.renderer,
            handshake: HandshakeRegistry::new(config.handshake_timeout),
            placeholder: PlaceholderSlot::default(),
            session: SessionSlot::default(),
            clock: LogicalClock::new(),
            config,
            phase: Mutex::new(TurnPhase::Idle),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_phase(&self, phase: TurnPhase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != phase {
            tracing::debug!(from = ?*current, to = ?phase, "turn phase");
            *current = phase;
        }
    }

    /// Persist `message` through the handshake with the standard deadline.
    pub async fn persist(
        &self,
        session: &SessionGuard,
        chat_id: &str,
        message: Message,
        context: &str,
    ) -> Result<(), AgentError> {
        let key = message.timestamp;
        session.track(key);
        let waiter = register_and_append(
            &self.handshake,
            self.chat_manager.as_ref(),
            chat_id,
            message,
            context,
            self.config.handshake_timeout,
        )
        .await?;

        // The append is never interrupted; only the wait for confirmation is.
        tokio::select! {
            biased;
            confirmed = waiter.wait() => match confirmed {
                Err(AgentError::HandshakeRejected { .. }) if session.is_cancelled() => {
                    Err(AgentError::Aborted)
                }
                other => other,
            },
            _ = session.token().cancelled() => {
                self.handshake.reject_and_clear(key, "generation stopped");
                Err(AgentError::Aborted)
            }
        }
    }

    /// Persist `message`, treating a handshake timeout as a logged warning.
    pub async fn persist_soft(
        &self,
        session: &SessionGuard,
        chat_id: &str,
        message: Message,
        context: &str,
    ) -> Result<(), AgentError> {
        match self.persist(session, chat_id, message, context).await {
            Err(AgentError::HandshakeTimeout { context }) => {
                tracing::warn!(%context, "message stored but not confirmed in time; continuing");
                Ok(())
            }
            other => other,
        }
    }

    /// Write a closing notice with the short deadline. Failures are logged,
    /// never propagated.
    pub async fn persist_notice(&self, chat_id: &str, message: Message, context: &str) {
        let result = persist_with_handshake(
            &self.handshake,
            self.chat_manager.as_ref(),
            chat_id,
            message,
            context,
            self.config.notice_timeout,
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, %context, "failed to persist notice");
        }
    }
}

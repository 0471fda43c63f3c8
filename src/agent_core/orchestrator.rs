//! Chat orchestrator: the public face of the turn engine.
//!
//! Owns one [`TurnContext`] and the "message added" listener for it.
//! `send_message` and `regenerate` share a single-flight session; `stop`
//! cancels whichever is running.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::context::{Collaborators, TurnConfig, TurnContext};
use super::errors::AgentError;
use super::regeneration;
use super::turn_controller;
use super::types::{TurnOutcome, TurnPhase};
use super::view::MessageListener;

pub struct ChatOrchestrator {
    ctx: Arc<TurnContext>,
    listener: JoinHandle<()>,
}

impl ChatOrchestrator {
    /// Build the orchestrator and start its listener.
    ///
    /// Must be called inside a tokio runtime. The subscription is taken
    /// before this returns, so no event of a later append is missed.
    pub fn new(collaborators: Collaborators, config: TurnConfig) -> Self {
        let ctx = Arc::new(TurnContext::new(collaborators, config));
        let listener = MessageListener::new(
            ctx.chat_manager.subscribe(),
            ctx.renderer.clone(),
            ctx.placeholder.clone(),
            ctx.handshake.clone(),
        )
        .spawn();
        tracing::debug!(
            max_turns = config.max_turns,
            handshake_timeout_ms = config.handshake_timeout.as_millis() as u64,
            "chat orchestrator ready"
        );
        Self { ctx, listener }
    }

    pub async fn send_message(&self, input: &str) -> Result<TurnOutcome, AgentError> {
        turn_controller::send_message(&self.ctx, input).await
    }

    pub async fn regenerate(&self, user_message_index: usize) -> Result<TurnOutcome, AgentError> {
        regeneration::regenerate(&self.ctx, user_message_index).await
    }

    /// Cancel the in-flight generation. Returns `false` when idle.
    pub fn stop(&self) -> bool {
        let stopped = self
            .ctx
            .session
            .cancel(&self.ctx.handshake, turn_controller::STOPPED_NOTICE);
        if stopped {
            tracing::info!("stop requested");
        }
        stopped
    }

    pub fn is_busy(&self) -> bool {
        self.ctx.session.is_busy()
    }

    pub fn phase(&self) -> TurnPhase {
        self.ctx.phase()
    }

    pub fn context(&self) -> Arc<TurnContext> {
        self.ctx.clone()
    }
}

impl Drop for ChatOrchestrator {
    fn drop(&mut self) {
        self.listener.abort();
        let rejected = self.ctx.handshake.reject_all("orchestrator shut down");
        if rejected > 0 {
            tracing::debug!(rejected, "pending handshakes rejected on shutdown");
        }
    }
}

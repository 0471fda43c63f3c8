//! Single-flight generation sessions.
//!
//! One turn or regeneration may run per orchestrator. Starting a session
//! hands out a fresh cancellation token; a second start while one is live is
//! refused. The returned guard restores the idle state when dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::handshake::HandshakeRegistry;
use super::interfaces::Renderer;

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    /// Handshake keys registered by this session.
    keys: Vec<i64>,
}

#[derive(Clone, Default)]
pub struct SessionSlot {
    inner: Arc<Mutex<Option<ActiveSession>>>,
    ids: Arc<AtomicU64>,
}

impl SessionSlot {
    fn slot(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot, or fail with [`AgentError::Busy`].
    pub fn try_begin(&self, renderer: Arc<dyn Renderer>) -> Result<SessionGuard, AgentError> {
        let cancel = CancellationToken::new();
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        {
            let mut slot = self.slot();
            if slot.is_some() {
                return Err(AgentError::Busy);
            }
            *slot = Some(ActiveSession {
                id,
                cancel: cancel.clone(),
                keys: Vec::new(),
            });
        }
        renderer.set_busy(true);
        tracing::debug!(session = id, "generation session started");

        Ok(SessionGuard {
            slot: self.clone(),
            id,
            cancel,
            renderer,
        })
    }

    /// Cancel the live session, if any, and force-fail the handshakes it is
    /// still waiting on so the turn unwinds without sitting out a deadline.
    pub fn cancel(&self, registry: &HandshakeRegistry, reason: &str) -> bool {
        let keys = match self.slot().as_mut() {
            Some(active) => {
                active.cancel.cancel();
                std::mem::take(&mut active.keys)
            }
            None => return false,
        };
        let rejected = keys
            .into_iter()
            .filter(|key| registry.reject_and_clear(*key, reason))
            .count();
        if rejected > 0 {
            tracing::debug!(rejected, "pending handshakes rejected on stop");
        }
        true
    }

    pub fn is_busy(&self) -> bool {
        self.slot().is_some()
    }
}

/// Ownership of the slot for one session.
pub struct SessionGuard {
    slot: SessionSlot,
    id: u64,
    cancel: CancellationToken,
    renderer: Arc<dyn Renderer>,
}

impl SessionGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a handshake key so a stop can force-reject it.
    pub fn track(&self, key: i64) {
        if let Some(active) = self.slot.slot().as_mut().filter(|a| a.id == self.id) {
            active.keys.push(key);
        }
    }

    /// Force-fail every still-pending handshake this session registered.
    pub fn reject_pending(&self, registry: &HandshakeRegistry, reason: &str) -> usize {
        let keys = match self.slot.slot().as_mut().filter(|a| a.id == self.id) {
            Some(active) => std::mem::take(&mut active.keys),
            None => Vec::new(),
        };
        keys.into_iter()
            .filter(|key| registry.reject_and_clear(*key, reason))
            .count()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        {
            let mut slot = self.slot.slot();
            if slot.as_ref().is_some_and(|a| a.id == self.id) {
                *slot = None;
            }
        }
        self.renderer.set_busy(false);
        tracing::debug!(session = self.id, "generation session ended");
    }
}

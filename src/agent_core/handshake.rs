//! Persistence handshake between the turn engine and the chat log.
//!
//! Before appending a message the engine registers the message's timestamp
//! here. The "message added" listener resolves the entry when the chat
//! manager confirms the append, so the engine only moves on once the message
//! is both stored and displayed. Every entry carries its own deadline; on
//! expiry the waiter fails with `HMA timeout for <context>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::AgentError;
use super::interfaces::ChatManager;
use super::types::Message;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Resolution = Result<(), AgentError>;

struct PendingHandshake {
    generation: u64,
    context: String,
    sender: oneshot::Sender<Resolution>,
    deadline: JoinHandle<()>,
}

struct Inner {
    pending: Mutex<HashMap<i64, PendingHandshake>>,
    generation: AtomicU64,
    timeout: Duration,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<i64, PendingHandshake>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deadline expiry. Only removes the entry it was started for.
    fn expire(&self, key: i64, generation: u64) {
        let entry = {
            let mut pending = self.pending();
            match pending.get(&key) {
                Some(p) if p.generation == generation => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            tracing::warn!(key, context = %entry.context, "handshake timed out");
            let _ = entry.sender.send(Err(AgentError::HandshakeTimeout {
                context: entry.context,
            }));
        }
    }
}

/// Key → resolver registry shared by the turn engine and the listener.
#[derive(Clone)]
pub struct HandshakeRegistry {
    inner: Arc<Inner>,
}

impl HandshakeRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Register `key` with the default deadline.
    pub fn register(&self, key: i64, context: impl Into<String>) -> Result<HandshakeWaiter, AgentError> {
        self.register_with_timeout(key, context, self.inner.timeout)
    }

    /// Register `key` and start its deadline. A key that is already pending
    /// is rejected.
    pub fn register_with_timeout(
        &self,
        key: i64,
        context: impl Into<String>,
        timeout: Duration,
    ) -> Result<HandshakeWaiter, AgentError> {
        let mut pending = self.inner.pending();
        if pending.contains_key(&key) {
            return Err(AgentError::DuplicateHandshake { key });
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(key, generation);
            }
        });

        pending.insert(
            key,
            PendingHandshake {
                generation,
                context: context.into(),
                sender,
                deadline,
            },
        );
        tracing::trace!(key, "handshake registered");

        Ok(HandshakeWaiter { key, receiver })
    }

    /// Resolve the entry for `key`. Unknown keys are ignored.
    pub fn invoke(&self, key: i64) -> bool {
        let entry = self.inner.pending().remove(&key);
        match entry {
            Some(entry) => {
                entry.deadline.abort();
                let _ = entry.sender.send(Ok(()));
                tracing::trace!(key, "handshake resolved");
                true
            }
            None => false,
        }
    }

    /// Force-fail the entry for `key`, if any.
    pub fn reject_and_clear(&self, key: i64, reason: &str) -> bool {
        let entry = self.inner.pending().remove(&key);
        match entry {
            Some(entry) => {
                entry.deadline.abort();
                let _ = entry.sender.send(Err(AgentError::HandshakeRejected {
                    reason: reason.to_string(),
                }));
                true
            }
            None => false,
        }
    }

    /// Force-fail every pending entry. Returns how many were cleared.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingHandshake> = self.inner.pending().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            entry.deadline.abort();
            let _ = entry.sender.send(Err(AgentError::HandshakeRejected {
                reason: reason.to_string(),
            }));
        }
        count
    }

    pub fn is_pending(&self, key: i64) -> bool {
        self.inner.pending().contains_key(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }
}

impl Default for HandshakeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

/// The engine side of one registration.
#[derive(Debug)]
pub struct HandshakeWaiter {
    key: i64,
    receiver: oneshot::Receiver<Resolution>,
}

impl HandshakeWaiter {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Wait for the listener to confirm, the deadline to expire, or a
    /// force-reject.
    pub async fn wait(self) -> Result<(), AgentError> {
        match self.receiver.await {
            Ok(resolution) => resolution,
            Err(_) => Err(AgentError::HandshakeRejected {
                reason: "handshake registry dropped".into(),
            }),
        }
    }
}

/// Register, append, then wait for confirmation.
pub async fn persist_with_handshake(
    registry: &HandshakeRegistry,
    chat_manager: &dyn ChatManager,
    chat_id: &str,
    message: Message,
    context: &str,
    timeout: Duration,
) -> Result<(), AgentError> {
    register_and_append(registry, chat_manager, chat_id, message, context, timeout)
        .await?
        .wait()
        .await
}

/// Register the message's key, then append it. The returned waiter resolves
/// once the listener sees the message.
///
/// If the append itself fails the registration is cleared and the append
/// error is returned.
pub async fn register_and_append(
    registry: &HandshakeRegistry,
    chat_manager: &dyn ChatManager,
    chat_id: &str,
    message: Message,
    context: &str,
    timeout: Duration,
) -> Result<HandshakeWaiter, AgentError> {
    let key = message.timestamp;
    let waiter = registry.register_with_timeout(key, context, timeout)?;

    if let Err(e) = chat_manager.add_message_and_await_persisted(chat_id, message).await {
        registry.reject_and_clear(key, "append failed");
        return Err(e);
    }
    Ok(waiter)
}

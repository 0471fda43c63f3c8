//! Conversation view state: the active placeholder and the "message added"
//! listener that renders confirmed messages and resolves handshakes.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::handshake::HandshakeRegistry;
use super::interfaces::Renderer;
use super::types::{MessageAdded, MessageKey, PlaceholderHandle};

// ─── Placeholder Slot ───────────────────────────────────────────────────────

/// Holds at most one live placeholder.
#[derive(Clone, Default)]
pub struct PlaceholderSlot {
    inner: Arc<Mutex<Option<PlaceholderHandle>>>,
}

impl PlaceholderSlot {
    fn slot(&self) -> MutexGuard<'_, Option<PlaceholderHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Option<PlaceholderHandle> {
        *self.slot()
    }

    pub fn is_active(&self, timestamp: i64) -> bool {
        self.active().is_some_and(|p| p.timestamp == timestamp)
    }

    /// Show the placeholder for `timestamp`.
    ///
    /// The same timestamp is reset to "thinking"; a different one tears the
    /// old placeholder down first.
    pub fn show(&self, renderer: &dyn Renderer, timestamp: i64) {
        let previous = {
            let mut slot = self.slot();
            let previous = *slot;
            *slot = Some(PlaceholderHandle { timestamp });
            previous
        };
        match previous {
            Some(p) if p.timestamp == timestamp => renderer.set_thinking(timestamp),
            Some(p) => {
                renderer.remove_placeholder(p.timestamp);
                renderer.create_placeholder(timestamp);
            }
            None => renderer.create_placeholder(timestamp),
        }
    }

    /// Remove whatever placeholder is live.
    pub fn clear(&self, renderer: &dyn Renderer) {
        let previous = self.slot().take();
        if let Some(p) = previous {
            renderer.remove_placeholder(p.timestamp);
        }
    }

    /// Remove the placeholder only if it belongs to `timestamp`.
    pub fn clear_if(&self, renderer: &dyn Renderer, timestamp: i64) -> bool {
        let removed = {
            let mut slot = self.slot();
            if slot.is_some_and(|p| p.timestamp == timestamp) {
                slot.take()
            } else {
                None
            }
        };
        match removed {
            Some(p) => {
                renderer.remove_placeholder(p.timestamp);
                true
            }
            None => false,
        }
    }
}

// ─── Message Listener ───────────────────────────────────────────────────────

/// How many rendered message keys the listener remembers.
pub const RENDERED_WINDOW: usize = 512;

/// Keys of recently rendered messages for one chat, oldest evicted first.
#[derive(Debug, Default)]
struct RecentKeys {
    chat_id: String,
    order: VecDeque<MessageKey>,
    seen: HashSet<MessageKey>,
}

impl RecentKeys {
    /// Record `key`; `false` when it was already present. Switching chats
    /// starts a fresh window.
    fn insert(&mut self, chat_id: &str, key: MessageKey) -> bool {
        if self.chat_id != chat_id {
            self.chat_id = chat_id.to_string();
            self.order.clear();
            self.seen.clear();
        }
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > RENDERED_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Consumes "message added" events for one orchestrator.
pub struct MessageListener {
    receiver: broadcast::Receiver<MessageAdded>,
    renderer: Arc<dyn Renderer>,
    placeholder: PlaceholderSlot,
    handshake: HandshakeRegistry,
    rendered: RecentKeys,
}

impl MessageListener {
    pub fn new(
        receiver: broadcast::Receiver<MessageAdded>,
        renderer: Arc<dyn Renderer>,
        placeholder: PlaceholderSlot,
        handshake: HandshakeRegistry,
    ) -> Self {
        Self {
            receiver,
            renderer,
            placeholder,
            handshake,
            rendered: RecentKeys::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        loop {
            match self.receiver.recv().await {
                Ok(event) => self.handle(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "message listener lagged; handshakes may time out");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("message event channel closed; listener exiting");
                    break;
                }
            }
        }
    }

    /// Render a confirmed message and resolve its handshake.
    ///
    /// A message already rendered is skipped unless it replaces the live
    /// placeholder. The handshake is resolved either way.
    fn handle(&mut self, event: MessageAdded) {
        let message = &event.message;
        let key = message.key();

        let replaced_placeholder =
            self.placeholder
                .clear_if(self.renderer.as_ref(), message.timestamp);
        let first_sighting = self.rendered.insert(&event.chat_id, key);

        if first_sighting || replaced_placeholder {
            self.renderer.render_message(message);
        } else {
            tracing::debug!(
                chat_id = %event.chat_id,
                timestamp = message.timestamp,
                role = message.role.as_str(),
                "duplicate message event, not re-rendered"
            );
        }

        self.handshake.invoke(message.timestamp);
    }
}

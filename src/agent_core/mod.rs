//! Agent Core: the turn orchestration engine.
//!
//! Submodules:
//! - `interfaces`: collaborator traits (chat manager, provider, tools, renderer)
//! - `stream_consumer`: drains one response stream into turn state
//! - `tool_resolver`: native vs. textual tool-call resolution
//! - `tool_execution`: sequential tool cycle, one `tool` message per call
//! - `handshake`: persist-then-confirm rendezvous with deadlines
//! - `view`: placeholder slot and the "message added" listener
//! - `session`: single-flight generation sessions and cancellation
//! - `turn_controller`: the bounded agent loop behind `send_message`
//! - `regeneration`: truncate history and re-answer a user message
//! - `orchestrator`: `ChatOrchestrator`, the public entry point
//! - `conversation`: reference chat managers and request building
//! - `database`: SQLite persistence for chats and messages
//! - `tool_router`: built-in tools
//! - `types`, `errors`: shared types and error enum

pub mod context;
pub mod conversation;
pub mod database;
pub mod errors;
pub mod handshake;
pub mod interfaces;
pub mod orchestrator;
pub mod regeneration;
pub mod session;
pub mod stream_consumer;
pub mod tool_execution;
pub mod tool_resolver;
pub mod tool_router;
pub mod turn_controller;
pub mod types;
pub mod view;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use context::{Collaborators, TurnConfig};
pub use conversation::{InMemoryChatManager, SqliteChatManager};
pub use database::ChatDatabase;
pub use errors::AgentError;
pub use handshake::HandshakeRegistry;
pub use interfaces::{ChatManager, Renderer, StreamProvider, TextualToolCallParser, ToolOutcome, ToolRunner};
pub use orchestrator::ChatOrchestrator;
pub use tool_router::BuiltinToolRunner;
pub use types::{ChatState, Message, MessageRole, TurnOutcome, TurnPhase};

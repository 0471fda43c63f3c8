//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that can end or interrupt a turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The user stopped the generation. Never reported as a failure.
    #[error("generation aborted by user")]
    Aborted,

    /// The model stream delivered an error chunk.
    #[error("{reason}")]
    Stream { reason: String },

    /// The stream provider could not open a stream.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The chat manager rejected an operation.
    #[error("chat manager error: {reason}")]
    ChatManager { reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// No "message added" event arrived for the key before the deadline.
    #[error("HMA timeout for {context}")]
    HandshakeTimeout { context: String },

    /// A pending handshake was force-failed.
    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    /// A handshake is already pending for this key.
    #[error("handshake already pending for key {key}")]
    DuplicateHandshake { key: i64 },

    /// Another turn or regeneration is in flight.
    #[error("a response is already being generated")]
    Busy,

    /// Empty or whitespace-only user input.
    #[error("message is empty")]
    EmptyInput,

    /// Regeneration was requested for something other than a user message.
    #[error("cannot regenerate from message {index}: {reason}")]
    InvalidRegenerationTarget { index: usize, reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl AgentError {
    /// Whether this error is a user cancellation rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, AgentError::Aborted)
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

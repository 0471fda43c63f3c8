//! Inference Client: OpenAI-compatible streaming client for local LLMs.
//!
//! This module handles all communication with the local model endpoint:
//! - Streaming chat completions and SSE parsing
//! - Textual tool-call parsing for models without native tool calls
//! - Fallback chain walked per request
//! - Model configuration loading from `_models/config.yaml`
//!
//! Switching models is a config change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig, ToolCallFormat};
pub use errors::InferenceError;
pub use tool_call_parser::FormatToolCallParser;
pub use types::{ChatMessage, ParsedToolCall, Role, StreamChunk, ToolCall};

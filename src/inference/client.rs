//! OpenAI-compatible inference client.
//!
//! Sends streaming chat completion requests to a local LLM endpoint and
//! exposes them as a [`StreamProvider`]. Each request walks the fallback
//! chain on its own, so the client is shared immutably between turns.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

use super::config::{ModelConfig, ModelsConfig, ToolCallFormat};
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::types::{ChatCompletionRequest, StreamChunk, ToolDefinition};
use crate::agent_core::conversation::build_chat_messages;
use crate::agent_core::interfaces::{ChunkStream, StreamProvider};
use crate::agent_core::types::ChatState;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for streaming calls.
///
/// Local models can take a long time to process a large context before the
/// first token.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// Fallback-chain entry that answers with a canned message.
pub const STATIC_RESPONSE_KEY: &str = "static_response";

pub const STATIC_RESPONSE_TEXT: &str =
    "The local model is not reachable right now. Check that the inference server is running and try again.";

// ─── InferenceClient ─────────────────────────────────────────────────────────

pub struct InferenceClient {
    http: HttpClient,
    config: ModelsConfig,
    /// Offered to native tool-calling models only.
    tools: Vec<ToolDefinition>,
}

impl InferenceClient {
    /// Create a client from the models configuration.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        if config.attempt_order().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: format!("active model '{}' not found in config", config.active_model),
            });
        }
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            config,
            tools: Vec::new(),
        })
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    fn active_model(&self) -> Option<&ModelConfig> {
        self.config.models.get(&self.config.active_model)
    }

    pub fn current_model_name(&self) -> &str {
        self.active_model().map_or("unknown", |m| m.display_name.as_str())
    }

    /// Tool-call format of the active model; drives the textual parser.
    pub fn tool_call_format(&self) -> ToolCallFormat {
        self.active_model()
            .map_or(ToolCallFormat::NativeJson, |m| m.tool_call_format)
    }

    fn has_static_fallback(&self) -> bool {
        self.config
            .fallback_chain
            .iter()
            .any(|k| k == STATIC_RESPONSE_KEY)
    }

    /// Attempt a single streaming request against `key`.
    async fn try_stream_request(
        &self,
        key: &str,
        model: &ModelConfig,
        chat: &ChatState,
    ) -> Result<ChunkStream, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));
        let tools = (model.tool_call_format == ToolCallFormat::NativeJson && !self.tools.is_empty())
            .then(|| self.tools.clone());
        let body = ChatCompletionRequest {
            model: model.model_name.clone().unwrap_or_else(|| key.to_string()),
            messages: build_chat_messages(chat, model.tool_call_format),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            stream: true,
        };

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map_or(0, Vec::len),
            max_tokens = body.max_tokens,
            "sending chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        duration_secs: CONNECT_TIMEOUT.as_secs(),
                    }
                } else {
                    InferenceError::ConnectionFailed {
                        endpoint: url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream())))
    }
}

#[async_trait]
impl StreamProvider for InferenceClient {
    async fn generate_chat_response_stream(
        &self,
        chat: &ChatState,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, InferenceError> {
        let order = self.config.attempt_order();
        let mut last_error: Option<InferenceError> = None;

        for key in &order {
            let Some(model) = self.config.models.get(key) else {
                continue;
            };
            match self.try_stream_request(key, model, chat).await {
                Ok(stream) => {
                    return Ok(Box::pin(stream.take_until(cancel.cancelled_owned())));
                }
                Err(e) if e.is_retriable() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if self.has_static_fallback() {
            tracing::warn!(attempted = ?order, "all models unavailable, using static response");
            return Ok(Box::pin(stream::iter([
                StreamChunk::Content {
                    text: STATIC_RESPONSE_TEXT.to_string(),
                },
                StreamChunk::Done,
            ])));
        }

        Err(match last_error {
            Some(e) if order.len() == 1 => e,
            _ => InferenceError::AllModelsUnavailable { attempted: order },
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Splits the HTTP body on SSE boundaries (`data: …\n\n`), parses each event
//! as a `ChatCompletionChunk`, accumulates native tool-call fragments across
//! deltas and emits provider-neutral `StreamChunk`s. Failures are delivered
//! in-band as `StreamChunk::Error`; the stream always ends with exactly one
//! `Done` or `Error`.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use uuid::Uuid;

use super::types::{ChatCompletionChunk, ChatMessage, Role, StreamChunk, ToolCall};

// ─── SSE byte parser ─────────────────────────────────────────────────────────

/// Turn a raw body byte stream into `StreamChunk`s.
pub fn parse_sse_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = StreamChunk> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    let state = StreamState::default();

    stream::unfold(
        (Box::pin(byte_stream), state, Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                if let Some(chunk) = state.queue.pop_front() {
                    return Some((chunk, (byte_stream, state, buffer)));
                }
                if state.finished {
                    return None;
                }

                if let Some(event_end) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    state.process_event(&String::from_utf8_lossy(&event));
                    continue;
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => state.fail(format!("stream read error: {e}")),
                    None => {
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if !rest.is_empty() {
                            state.process_event(&rest);
                        }
                        state.finish();
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// A native tool call being assembled from deltas.
#[derive(Debug, Default)]
struct PendingToolCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct StreamState {
    /// All answer text seen so far; becomes the lead-in prose of a native
    /// tool-call message.
    accumulated_content: String,
    pending_tool_calls: Vec<PendingToolCall>,
    queue: VecDeque<StreamChunk>,
    finished: bool,
}

impl StreamState {
    /// Process one SSE event (may contain several `data:` lines).
    fn process_event(&mut self, event: &str) {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    self.finish();
                    return;
                }
                data_content.push_str(data);
            }
        }

        if data_content.is_empty() {
            return;
        }

        match serde_json::from_str::<ChatCompletionChunk>(&data_content) {
            Ok(chunk) => self.process_chunk(chunk),
            Err(e) => self.fail(format!("failed to parse SSE chunk: {e} (data: {data_content})")),
        }
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) {
        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            self.fail(message);
            return;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        // Only `content` is surfaced; `reasoning` is dropped.
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.accumulated_content.push_str(&content);
            self.queue.push_back(StreamChunk::Content { text: content });
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let pending = match self.pending_tool_calls.iter().position(|p| p.index == index) {
                Some(pos) => &mut self.pending_tool_calls[pos],
                None => {
                    self.pending_tool_calls.push(PendingToolCall {
                        index,
                        ..Default::default()
                    });
                    let last = self.pending_tool_calls.len() - 1;
                    &mut self.pending_tool_calls[last]
                }
            };
            if tc.id.is_some() {
                pending.id = tc.id;
            }
            if let Some(f) = tc.function {
                if let Some(n) = f.name {
                    pending.name.push_str(&n);
                }
                if let Some(a) = f.arguments {
                    pending.arguments.push_str(&a);
                }
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            self.flush_tool_calls();
        }
    }

    /// Emit accumulated native tool calls, if any, as one `ToolCalls` chunk.
    fn flush_tool_calls(&mut self) {
        if self.pending_tool_calls.is_empty() {
            return;
        }
        let calls: Vec<ToolCall> = std::mem::take(&mut self.pending_tool_calls)
            .into_iter()
            .map(|p| {
                let id = p.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
                ToolCall::function(id, p.name, p.arguments)
            })
            .collect();

        tracing::debug!(count = calls.len(), "native tool calls assembled");

        let assistant_message = ChatMessage {
            role: Role::Assistant,
            content: Some(self.accumulated_content.clone()),
            tool_call_id: None,
            tool_calls: Some(calls.clone()),
        };
        self.queue.push_back(StreamChunk::ToolCalls {
            calls,
            assistant_message: Some(assistant_message),
        });
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.flush_tool_calls();
        self.queue.push_back(StreamChunk::Done);
        self.finished = true;
    }

    fn fail(&mut self, error: String) {
        if self.finished {
            return;
        }
        tracing::warn!(error = %error, "SSE stream failed");
        self.queue.push_back(StreamChunk::Error { error });
        self.finished = true;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(parts: Vec<&str>) -> Vec<StreamChunk> {
        let owned: Vec<Result<Vec<u8>, std::io::Error>> =
            parts.into_iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        parse_sse_stream(stream::iter(owned)).collect().await
    }

    fn content(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{text}\"}},\"finish_reason\":null}}]}}\n\n")
    }

    #[tokio::test]
    async fn test_content_tokens_then_done() {
        let body = format!("{}{}data: [DONE]\n\n", content("2 + 2"), content(" = 4"));
        let chunks = collect(vec![body.as_str()]).await;
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Content { text: "2 + 2".into() },
                StreamChunk::Content { text: " = 4".into() },
                StreamChunk::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_event_split_across_reads() {
        let body = content("hello");
        let (a, b) = body.split_at(17);
        let chunks = collect(vec![a, b, "data: [DONE]\n\n"]).await;
        assert_eq!(chunks[0], StreamChunk::Content { text: "hello".into() });
        assert_eq!(chunks.len(), 2);
    }

    #[tokio::test]
    async fn test_native_tool_call_fragments_accumulate() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Let me compute.\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"calc\",\"arguments\":\"{\\\"expr\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"2+2\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = collect(vec![body]).await;
        assert_eq!(chunks.len(), 3);
        match &chunks[1] {
            StreamChunk::ToolCalls { calls, assistant_message } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "c1");
                assert_eq!(calls[0].function.name, "calc");
                assert_eq!(calls[0].function.arguments, r#"{"expr":"2+2"}"#);
                let msg = assistant_message.as_ref().unwrap();
                assert_eq!(msg.content.as_deref(), Some("Let me compute."));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
        assert_eq!(chunks[2], StreamChunk::Done);
    }

    #[tokio::test]
    async fn test_malformed_arguments_pass_through_with_generated_id() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"function\":{\"name\":\"calc\",\"arguments\":\"{not json\"}}]}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = collect(vec![body]).await;
        match &chunks[0] {
            StreamChunk::ToolCalls { calls, .. } => {
                assert!(calls[0].id.starts_with("call_"));
                assert_eq!(calls[0].function.arguments, "{not json");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_event_yields_error_and_ends() {
        let chunks = collect(vec!["data: {oops\n\n", content("late").as_str()]).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], StreamChunk::Error { .. }));
    }

    #[tokio::test]
    async fn test_error_object_yields_error() {
        let chunks = collect(vec!["data: {\"error\":{\"message\":\"model crashed\"}}\n\n"]).await;
        assert_eq!(chunks, vec![StreamChunk::Error { error: "model crashed".into() }]);
    }

    #[tokio::test]
    async fn test_body_end_without_done_marker() {
        let chunks = collect(vec![content("hi").as_str()]).await;
        assert_eq!(chunks.last(), Some(&StreamChunk::Done));
    }

    #[tokio::test]
    async fn test_crlf_and_keepalive_comments() {
        let body = ": keep-alive\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let chunks = collect(vec![body]).await;
        assert_eq!(
            chunks,
            vec![StreamChunk::Content { text: "x".into() }, StreamChunk::Done]
        );
    }

    #[tokio::test]
    async fn test_read_error_becomes_error_chunk() {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Ok(content("a").into_bytes()),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
        ];
        let chunks: Vec<StreamChunk> = parse_sse_stream(stream::iter(parts)).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[1], StreamChunk::Error { error } if error.contains("reset")));
    }
}

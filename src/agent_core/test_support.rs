//! Scripted collaborators for turn-engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::context::{Collaborators, TurnConfig, TurnContext};
use super::conversation::InMemoryChatManager;
use super::interfaces::{
    ChatManager, ChunkStream, Renderer, StreamProvider, TextualToolCallParser, ToolOutcome,
    ToolRunner,
};
use super::orchestrator::ChatOrchestrator;
use super::types::{ChatState, Message};
use crate::inference::config::ToolCallFormat;
use crate::inference::tool_call_parser::FormatToolCallParser;
use crate::inference::types::{ParsedToolCall, StreamChunk};
use crate::inference::InferenceError;

pub const CHAT_ID: &str = "chat";

// ─── Renderer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    Create(i64),
    Thinking(i64),
    Progressive(i64, String),
    Remove(i64),
    Rendered(Message),
    Notify(String),
    Busy(bool),
    Confirm(usize),
}

pub struct RecordingRenderer {
    events: Mutex<Vec<RenderEvent>>,
    confirm: AtomicBool,
    progressive: Notify,
}

impl RecordingRenderer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            confirm: AtomicBool::new(true),
            progressive: Notify::new(),
        })
    }

    pub fn set_confirm(&self, answer: bool) {
        self.confirm.store(answer, Ordering::SeqCst);
    }

    fn push(&self, event: RenderEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn rendered_contents(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RenderEvent::Rendered(m) => Some(m.content),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RenderEvent::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least one progressive render has happened.
    pub async fn wait_for_progressive(&self) {
        self.progressive.notified().await;
    }
}

impl Renderer for RecordingRenderer {
    fn create_placeholder(&self, timestamp: i64) {
        self.push(RenderEvent::Create(timestamp));
    }
    fn set_thinking(&self, timestamp: i64) {
        self.push(RenderEvent::Thinking(timestamp));
    }
    fn render_progressive(&self, timestamp: i64, text: &str) {
        self.push(RenderEvent::Progressive(timestamp, text.to_string()));
        self.progressive.notify_one();
    }
    fn remove_placeholder(&self, timestamp: i64) {
        self.push(RenderEvent::Remove(timestamp));
    }
    fn render_message(&self, message: &Message) {
        self.push(RenderEvent::Rendered(message.clone()));
    }
    fn notify(&self, text: &str) {
        self.push(RenderEvent::Notify(text.to_string()));
    }
    fn set_busy(&self, busy: bool) {
        self.push(RenderEvent::Busy(busy));
    }
    fn confirm_discard(&self, count: usize) -> bool {
        self.push(RenderEvent::Confirm(count));
        self.confirm.load(Ordering::SeqCst)
    }
}

// ─── Provider ───────────────────────────────────────────────────────────────

/// One scripted response.
pub enum Script {
    /// Emit these chunks, then end.
    Chunks(Vec<StreamChunk>),
    /// Emit these chunks, then stall until cancelled.
    Stall(Vec<StreamChunk>),
    /// Fail to open the stream.
    OpenError(String),
}

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatState>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Chat snapshots passed to each stream request.
    pub fn requests(&self) -> Vec<ChatState> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl StreamProvider for ScriptedProvider {
    async fn generate_chat_response_stream(
        &self,
        chat: &ChatState,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, InferenceError> {
        self.requests.lock().unwrap().push(chat.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Chunks(vec![StreamChunk::Done]));

        match script {
            Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks))),
            Script::Stall(chunks) => Ok(Box::pin(
                stream::iter(chunks)
                    .chain(stream::pending())
                    .take_until(cancel.cancelled_owned()),
            )),
            Script::OpenError(reason) => Err(InferenceError::StreamError { reason }),
        }
    }
}

pub fn text(t: &str) -> StreamChunk {
    StreamChunk::Content { text: t.into() }
}

// ─── Tool runner ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ScriptedToolRunner {
    outcomes: HashMap<String, ToolOutcome>,
    /// Tools that never finish.
    stalls: HashSet<String>,
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
    started: Notify,
}

impl ScriptedToolRunner {
    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        self.invocations.lock().unwrap().clone()
    }

    /// Wait until a stalling tool has been entered.
    pub async fn wait_for_stall(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn execute_tool(&self, name: &str, args: serde_json::Value) -> ToolOutcome {
        self.invocations.lock().unwrap().push((name.to_string(), args));
        if self.stalls.contains(name) {
            self.started.notify_one();
            return futures::future::pending().await;
        }
        self.outcomes.get(name).cloned().unwrap_or(ToolOutcome::Failure {
            error: format!("unknown tool: {name}"),
        })
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────────

/// Returns one call named `name` for any text and counts invocations.
pub struct CountingParser {
    name: String,
    calls: AtomicUsize,
}

impl CountingParser {
    pub fn matching(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextualToolCallParser for CountingParser {
    fn parse_all(&self, _text: &str) -> Vec<ParsedToolCall> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        vec![ParsedToolCall {
            name: self.name.clone(),
            arguments: "{}".into(),
        }]
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: ChatOrchestrator,
    pub ctx: Arc<TurnContext>,
    pub chat: Arc<InMemoryChatManager>,
    pub provider: Arc<ScriptedProvider>,
    pub runner: Arc<ScriptedToolRunner>,
    pub renderer: Arc<RecordingRenderer>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.chat.messages(CHAT_ID)
    }

    /// Seed history directly, bypassing the engine.
    pub async fn seed(&self, messages: Vec<Message>) {
        for m in messages {
            self.ctx.clock.observe(m.timestamp);
            self.chat.add_message_and_await_persisted(CHAT_ID, m).await.unwrap();
        }
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    scripts: Vec<Script>,
    outcomes: HashMap<String, ToolOutcome>,
    stalls: HashSet<String>,
    format: Option<ToolCallFormat>,
    config: TurnConfig,
    silent_chat: bool,
    persist_delay: Duration,
    event_delay: Duration,
}

impl HarnessBuilder {
    pub fn script(mut self, script: Script) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn chunks(self, chunks: Vec<StreamChunk>) -> Self {
        self.script(Script::Chunks(chunks))
    }

    pub fn tool_result(mut self, name: &str, result: &str) -> Self {
        self.outcomes.insert(
            name.into(),
            ToolOutcome::Success {
                result: result.into(),
            },
        );
        self
    }

    pub fn tool_failure(mut self, name: &str, error: &str) -> Self {
        self.outcomes.insert(
            name.into(),
            ToolOutcome::Failure {
                error: error.into(),
            },
        );
        self
    }

    /// A tool that runs until the turn is stopped.
    pub fn stalling_tool(mut self, name: &str) -> Self {
        self.stalls.insert(name.into());
        self
    }

    pub fn format(mut self, format: ToolCallFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.config.max_turns = max_turns;
        self
    }

    /// Chat manager that never publishes "message added" events.
    pub fn silent_chat(mut self, handshake_timeout: Duration) -> Self {
        self.silent_chat = true;
        self.config.handshake_timeout = handshake_timeout;
        self.config.notice_timeout = handshake_timeout;
        self
    }

    pub fn notice_timeout(mut self, timeout: Duration) -> Self {
        self.config.notice_timeout = timeout;
        self
    }

    /// Each append takes this long before it stores the message.
    pub fn persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    /// Each "message added" event arrives this long after its append returned.
    pub fn event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Must run inside a tokio runtime: the listener task is spawned here.
    pub fn build(self) -> Harness {
        let mut chat = InMemoryChatManager::new()
            .with_persist_delay(self.persist_delay)
            .with_event_delay(self.event_delay);
        if self.silent_chat {
            chat = chat.without_events();
        }
        chat.open_new_chat(CHAT_ID, None);
        let chat = Arc::new(chat);
        let provider = Arc::new(ScriptedProvider::new(self.scripts));
        let runner = Arc::new(ScriptedToolRunner {
            outcomes: self.outcomes,
            stalls: self.stalls,
            ..Default::default()
        });
        let renderer = RecordingRenderer::new();
        let parser = Arc::new(FormatToolCallParser::new(
            self.format.unwrap_or(ToolCallFormat::NativeJson),
        ));

        let orchestrator = ChatOrchestrator::new(
            Collaborators {
                chat_manager: chat.clone(),
                provider: provider.clone(),
                tool_runner: runner.clone(),
                parser,
                renderer: renderer.clone(),
            },
            self.config,
        );
        let ctx = orchestrator.context();

        Harness {
            orchestrator,
            ctx,
            chat,
            provider,
            runner,
            renderer,
        }
    }
}

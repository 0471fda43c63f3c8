//! Terminal front-end: a line REPL over [`ChatOrchestrator`].
//!
//! Typed lines are sent as user messages; lines starting with `/` are
//! commands. Ctrl-C stops the response being generated.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::session;
use crate::agent_core::tool_router::truncate_utf8;
use crate::agent_core::{
    AgentError, ChatOrchestrator, Message, MessageRole, Renderer, SqliteChatManager, TurnOutcome,
};

const TOOL_PREVIEW_BYTES: usize = 200;

pub const HELP: &str = "\
Commands:
  /history        show the current chat with message numbers
  /regen <n>      regenerate the answer to user message <n>
  /new            start a new chat
  /chats          list chats
  /open <id>      open a chat by id prefix
  /delete <id>    delete a chat by id prefix
  /help           show this help
  /quit           exit
Ctrl-C stops the response being generated.";

// ─── Terminal Renderer ──────────────────────────────────────────────────────

#[derive(Default)]
struct TerminalState {
    /// Placeholder being streamed into, and how much of it is printed.
    streaming: Option<(i64, String)>,
    /// The last placeholder removed, kept so its final message is not
    /// printed twice.
    finished: Option<(i64, String)>,
    /// Answer for the next `confirm_discard`, decided by the REPL.
    discard_answer: Option<bool>,
}

/// Prints to stdout. Streamed text is written incrementally.
#[derive(Default)]
pub struct TerminalRenderer {
    state: Mutex<TerminalState>,
}

impl TerminalRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-answer the next discard confirmation.
    pub fn answer_next_discard(&self, answer: bool) {
        self.state().discard_answer = Some(answer);
    }

    fn print(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// How a confirmed message is shown, or `None` when nothing should print.
pub fn format_message(message: &Message) -> Option<String> {
    match message.role {
        // The user typed it.
        MessageRole::User => None,
        MessageRole::Assistant => {
            let mut out = String::new();
            if !message.content.trim().is_empty() {
                out.push_str(&format!("assistant: {}\n", message.content.trim_end()));
            }
            for call in message.tool_calls.iter().flatten() {
                out.push_str(&format!(
                    "  → {}({})\n",
                    call.function.name, call.function.arguments
                ));
            }
            (!out.is_empty()).then_some(out)
        }
        MessageRole::Tool => {
            let name = message.tool_name.as_deref().unwrap_or("tool");
            let body = truncate_utf8(message.content.trim(), TOOL_PREVIEW_BYTES);
            let ellipsis = if body.len() < message.content.trim().len() { "…" } else { "" };
            Some(format!("  ← {name}: {}{ellipsis}\n", body.replace('\n', " ")))
        }
        MessageRole::System => Some(format!("[{}]\n", message.content)),
        MessageRole::Error => Some(format!("[error] {}\n", message.content)),
    }
}

impl Renderer for TerminalRenderer {
    fn create_placeholder(&self, timestamp: i64) {
        self.state().streaming = Some((timestamp, String::new()));
        self.print("assistant: …\r");
    }

    fn set_thinking(&self, timestamp: i64) {
        let mut state = self.state();
        if let Some((ts, printed)) = state.streaming.as_mut() {
            if *ts == timestamp && !printed.is_empty() {
                printed.clear();
                drop(state);
                self.print("\nassistant: …\r");
            }
        }
    }

    fn render_progressive(&self, timestamp: i64, text: &str) {
        let delta = {
            let mut state = self.state();
            let Some((ts, printed)) = state.streaming.as_mut() else {
                return;
            };
            if *ts != timestamp {
                return;
            }
            let delta = match text.strip_prefix(printed.as_str()) {
                Some(rest) if printed.is_empty() => format!("assistant: {rest}"),
                Some(rest) => rest.to_string(),
                None => format!("\nassistant: {text}"),
            };
            *printed = text.to_string();
            delta
        };
        self.print(&delta);
    }

    fn remove_placeholder(&self, timestamp: i64) {
        let finished = {
            let mut state = self.state();
            match state.streaming.take() {
                Some((ts, printed)) if ts == timestamp => {
                    state.finished = Some((ts, printed.clone()));
                    printed
                }
                other => {
                    state.streaming = other;
                    return;
                }
            }
        };
        if finished.is_empty() {
            // Clear the "thinking" line.
            self.print("             \r");
        } else {
            self.print("\n");
        }
    }

    fn render_message(&self, message: &Message) {
        let already_streamed = {
            let state = self.state();
            state.finished.as_ref().is_some_and(|(ts, printed)| {
                *ts == message.timestamp
                    && message.role == MessageRole::Assistant
                    && !printed.is_empty()
                    && printed.trim_end() == message.content.trim_end()
            })
        };
        if already_streamed {
            let calls: Message = Message {
                content: String::new(),
                ..message.clone()
            };
            if let Some(text) = format_message(&calls) {
                self.print(&text);
            }
            return;
        }
        if let Some(text) = format_message(message) {
            self.print(&text);
        }
    }

    fn notify(&self, text: &str) {
        eprintln!("! {text}");
    }

    fn set_busy(&self, busy: bool) {
        tracing::trace!(busy, "busy indicator");
    }

    fn confirm_discard(&self, count: usize) -> bool {
        let answer = self.state().discard_answer.take().unwrap_or(false);
        tracing::debug!(count, answer, "discard confirmation");
        answer
    }
}

// ─── REPL ───────────────────────────────────────────────────────────────────

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    History,
    Regenerate(usize),
    New,
    Chats,
    Open(String),
    Delete(String),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match (name, arg) {
        ("history", _) => Command::History,
        ("regen", n) => match n.parse::<usize>() {
            Ok(n) => Command::Regenerate(n),
            Err(_) => Command::Invalid("usage: /regen <message number>".into()),
        },
        ("new", _) => Command::New,
        ("chats", _) => Command::Chats,
        ("open", id) if !id.is_empty() => Command::Open(id.to_string()),
        ("delete", id) if !id.is_empty() => Command::Delete(id.to_string()),
        ("open", _) | ("delete", _) => Command::Invalid(format!("usage: /{name} <chat id prefix>")),
        ("help", _) => Command::Help,
        ("quit", _) | ("exit", _) => Command::Quit,
        _ => Command::Invalid(format!("unknown command '/{name}', try /help")),
    }
}

/// Everything the REPL drives.
pub struct ChatRepl {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub chats: Arc<SqliteChatManager>,
    pub renderer: Arc<TerminalRenderer>,
    pub system_prompt: String,
}

impl ChatRepl {
    /// Read lines from stdin until `/quit` or end of input.
    pub async fn run(self) -> anyhow::Result<()> {
        let (tx, mut lines) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut reader = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let stopper = self.orchestrator.clone();
        let ctrl_c = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !stopper.stop() {
                    eprintln!("! nothing to stop; type /quit to exit");
                }
            }
        });

        println!("{HELP}\n");
        self.print_prompt();
        while let Some(line) = lines.recv().await {
            match parse_command(&line) {
                Command::Quit => break,
                Command::Empty => {}
                command => {
                    if let Err(e) = self.handle(command, &mut lines).await {
                        eprintln!("! {e}");
                    }
                }
            }
            self.print_prompt();
        }

        ctrl_c.abort();
        Ok(())
    }

    fn print_prompt(&self) {
        self.renderer.print("> ");
    }

    async fn handle(
        &self,
        command: Command,
        lines: &mut mpsc::UnboundedReceiver<String>,
    ) -> Result<(), AgentError> {
        match command {
            Command::Send(text) => {
                let outcome = self.orchestrator.send_message(&text).await?;
                self.report(&outcome);
                if let Some(chat_id) = self.chats.active_chat_id() {
                    session::title_from_first_message(&self.chats, &chat_id)?;
                }
            }
            Command::Regenerate(index) => {
                let Some(chat_id) = self.chats.active_chat_id() else {
                    return Err(AgentError::ChatManager {
                        reason: "no active chat".into(),
                    });
                };
                let total = self.chats.chat_messages(&chat_id)?.len();
                let later = total.saturating_sub(index + 1);
                if index < total && later > 0 {
                    self.renderer
                        .print(&format!("Discard {later} later message(s)? [y/N] "));
                    let answer = lines.recv().await.unwrap_or_default();
                    self.renderer
                        .answer_next_discard(matches!(answer.trim(), "y" | "Y" | "yes"));
                }
                let outcome = self.orchestrator.regenerate(index).await?;
                self.report(&outcome);
            }
            Command::History => {
                let Some(chat_id) = self.chats.active_chat_id() else {
                    return Ok(());
                };
                for line in session::history_lines(&self.chats.chat_messages(&chat_id)?) {
                    println!("{line}");
                }
            }
            Command::New => {
                let id = session::new_chat(&self.chats, &self.system_prompt)?;
                println!("new chat {}", short_id(&id));
            }
            Command::Chats => {
                for chat in session::list_chats(&self.chats)? {
                    println!(
                        "{} {} {:<40} {:>4} msgs  {}",
                        if chat.active { "*" } else { " " },
                        short_id(&chat.id),
                        chat.title,
                        chat.message_count,
                        chat.updated_at
                    );
                }
            }
            Command::Open(prefix) => {
                let id = session::open_chat(&self.chats, &prefix)?;
                println!("opened chat {}", short_id(&id));
                for line in session::history_lines(&self.chats.chat_messages(&id)?) {
                    println!("{line}");
                }
            }
            Command::Delete(prefix) => {
                let id = session::open_chat(&self.chats, &prefix)?;
                self.chats.delete_chat(&id)?;
                let fresh = session::new_chat(&self.chats, &self.system_prompt)?;
                println!("deleted chat {}; new chat {}", short_id(&id), short_id(&fresh));
            }
            Command::Help => println!("{HELP}"),
            Command::Invalid(reason) => eprintln!("! {reason}"),
            Command::Quit | Command::Empty => {}
        }
        Ok(())
    }

    fn report(&self, outcome: &TurnOutcome) {
        match outcome {
            TurnOutcome::Completed { turns } if *turns > 1 => {
                tracing::debug!(turns, "answer completed after tool use");
            }
            TurnOutcome::Failed { reason } => {
                tracing::warn!(%reason, "turn failed");
            }
            _ => {}
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

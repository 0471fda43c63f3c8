pub mod agent_core;
pub mod commands;
pub mod inference;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use agent_core::{
    BuiltinToolRunner, ChatDatabase, ChatOrchestrator, Collaborators, SqliteChatManager,
};
use commands::chat::{ChatRepl, TerminalRenderer};
use commands::settings::TurnSettings;
use inference::{FormatToolCallParser, InferenceClient, ToolCallFormat};

/// Return the platform-standard data directory for localchat.
///
/// - macOS: `~/Library/Application Support/localchat/`
/// - Windows: `{FOLDERID_RoamingAppData}\localchat\`
/// - Linux: `$XDG_DATA_HOME/localchat/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.localchat/` only if none of the above can be resolved.
pub(crate) fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("localchat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".localchat")
}

/// Initialize the tracing subscriber, writing structured logs to the data
/// directory so the terminal stays clean.
///
/// On each startup:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("localchat=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== localchat starting ==="
    );
    Ok(())
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Path of the chat database in the data directory.
fn resolve_db_path() -> PathBuf {
    data_dir().join("chats.db")
}

/// The built-in system prompt, with tool-call instructions for models that
/// call tools in plain text.
pub fn default_system_prompt(format: ToolCallFormat) -> String {
    let base = "You are a helpful assistant running entirely on this computer. \
                Answer concisely. Use a tool only when it helps answer the question.";
    let catalog = BuiltinToolRunner::describe();
    match format {
        ToolCallFormat::NativeJson => base.to_string(),
        ToolCallFormat::Pythonic => format!(
            "{base}\n\nAvailable tools:\n{catalog}\n\n\
             To call a tool, reply with exactly these two lines and nothing else:\n\
             Tool: <tool name>\nArguments: <JSON object>"
        ),
        ToolCallFormat::Bracket => format!(
            "{base}\n\nAvailable tools:\n{catalog}\n\n\
             To call a tool, reply with <|tool_call_start|>[namespace.tool(arg=\"value\")]<|tool_call_end|>"
        ),
    }
}

/// Start the terminal chat.
pub async fn run() -> anyhow::Result<()> {
    init_tracing()?;

    let settings = TurnSettings::load_or_default();
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;

    let config_path = inference::config::find_config_path(&cwd)?;
    let models = inference::config::load_models_config(&config_path)?;
    let client = InferenceClient::from_config(models)?.with_tools(BuiltinToolRunner::definitions());
    let format = client.tool_call_format();
    tracing::info!(
        config = %config_path.display(),
        model = client.current_model_name(),
        ?format,
        "inference client ready"
    );

    let db_path = resolve_db_path();
    let db = ChatDatabase::open(&db_path.to_string_lossy())
        .with_context(|| format!("failed to open chat database {}", db_path.display()))?;
    let chats = Arc::new(SqliteChatManager::new(db));
    let system_prompt = settings
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt(format));
    commands::session::new_chat(&chats, &system_prompt)?;
    tracing::info!(db_path = %db_path.display(), "chat database initialized");

    let renderer = Arc::new(TerminalRenderer::new());
    let orchestrator = Arc::new(ChatOrchestrator::new(
        Collaborators {
            chat_manager: chats.clone(),
            provider: Arc::new(client),
            tool_runner: Arc::new(BuiltinToolRunner::new(cwd)),
            parser: Arc::new(FormatToolCallParser::new(format)),
            renderer: renderer.clone(),
        },
        settings.turn_config(),
    ));

    println!("localchat {}", env!("CARGO_PKG_VERSION"));
    ChatRepl {
        orchestrator,
        chats,
        renderer,
        system_prompt,
    }
    .run()
    .await
}

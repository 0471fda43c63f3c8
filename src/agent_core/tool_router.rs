//! Built-in tools: the default [`ToolRunner`] for the terminal front-end.
//!
//! Tool names are dotted (`namespace.tool`) so every supported textual
//! call syntax can address them. Results are plain text, truncated to
//! [`MAX_TOOL_RESULT_BYTES`] on a UTF-8 boundary before they reach history.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use super::interfaces::{ToolOutcome, ToolRunner};
use crate::inference::types::ToolDefinition;

/// Maximum size of a tool result stored in history.
pub const MAX_TOOL_RESULT_BYTES: usize = 6000;

pub const LIST_DIRECTORY: &str = "filesystem.list_directory";
pub const READ_FILE: &str = "filesystem.read_file";
pub const CURRENT_TIME: &str = "system.current_time";

/// Name and one-line usage of each built-in tool.
pub const TOOL_CATALOG: &[(&str, &str)] = &[
    (LIST_DIRECTORY, "List a directory. Arguments: {\"path\": string}"),
    (READ_FILE, "Read a UTF-8 text file. Arguments: {\"path\": string}"),
    (CURRENT_TIME, "Current local date and time. No arguments."),
];

/// Runs the built-in tools. Relative paths resolve against `root`.
pub struct BuiltinToolRunner {
    root: PathBuf,
}

impl BuiltinToolRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Catalog text for a system prompt.
    pub fn describe() -> String {
        TOOL_CATALOG
            .iter()
            .map(|(name, usage)| format!("- {name}: {usage}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Definitions for models with native tool calling.
    pub fn definitions() -> Vec<ToolDefinition> {
        let path_schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        TOOL_CATALOG
            .iter()
            .map(|(name, usage)| {
                let parameters = if *name == CURRENT_TIME {
                    serde_json::json!({ "type": "object", "properties": {} })
                } else {
                    path_schema.clone()
                };
                ToolDefinition::function(*name, *usage, parameters)
            })
            .collect()
    }

    fn resolve_path(&self, args: &Value) -> Result<PathBuf, String> {
        let raw = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'path'")?;
        let path = match raw.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .ok_or("cannot resolve home directory")?
                .join(rest),
            None if raw == "~" => dirs::home_dir().ok_or("cannot resolve home directory")?,
            None => PathBuf::from(raw),
        };
        Ok(if path.is_absolute() { path } else { self.root.join(path) })
    }
}

#[async_trait]
impl ToolRunner for BuiltinToolRunner {
    async fn execute_tool(&self, name: &str, args: Value) -> ToolOutcome {
        let result = match name {
            LIST_DIRECTORY => match self.resolve_path(&args) {
                Ok(path) => tokio::task::spawn_blocking(move || list_directory(&path))
                    .await
                    .unwrap_or_else(|e| Err(format!("directory listing task failed: {e}"))),
                Err(e) => Err(e),
            },
            READ_FILE => match self.resolve_path(&args) {
                Ok(path) => read_file(&path).await,
                Err(e) => Err(e),
            },
            CURRENT_TIME => Ok(chrono::Local::now().format("%A, %Y-%m-%d %H:%M:%S %Z").to_string()),
            other => Err(format!("unknown tool '{other}'")),
        };

        match result {
            Ok(text) => {
                let truncated = truncate_utf8(&text, MAX_TOOL_RESULT_BYTES);
                if truncated.len() < text.len() {
                    tracing::debug!(tool = name, bytes = text.len(), "tool result truncated");
                    ToolOutcome::Success {
                        result: format!("{truncated}\n[truncated]"),
                    }
                } else {
                    ToolOutcome::Success { result: text }
                }
            }
            Err(error) => ToolOutcome::Failure { error },
        }
    }
}

/// Entries sorted directories first, then by name. Hidden entries are skipped.
fn list_directory(path: &Path) -> Result<String, String> {
    if !path.is_dir() {
        return Err(format!("not a directory: {}", path.display()));
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| format!("failed to read directory: {e}"))? {
        let entry = entry.map_err(|e| format!("failed to read entry: {e}"))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let metadata = entry
            .metadata()
            .map_err(|e| format!("failed to read metadata: {e}"))?;
        entries.push((metadata.is_dir(), name, metadata.len()));
    }

    entries.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
    });

    if entries.is_empty() {
        return Ok(format!("{} is empty", path.display()));
    }
    Ok(entries
        .into_iter()
        .map(|(is_dir, name, size)| {
            if is_dir {
                format!("{name}/")
            } else {
                format!("{name} ({size} bytes)")
            }
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Bytes read from a file: enough to overflow one result, plus room for a
/// UTF-8 sequence split at the limit.
const READ_LIMIT: u64 = MAX_TOOL_RESULT_BYTES as u64 + 4;

async fn read_file(path: &Path) -> Result<String, String> {
    let read_error = |e: std::io::Error| format!("failed to read {}: {e}", path.display());
    let file = tokio::fs::File::open(path).await.map_err(read_error)?;
    let mut bytes = Vec::new();
    file.take(READ_LIMIT)
        .read_to_end(&mut bytes)
        .await
        .map_err(read_error)?;

    let not_text = || format!("{} is not a UTF-8 text file", path.display());
    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        // Incomplete sequence at the cut: keep the valid prefix.
        Err(e) if e.utf8_error().error_len().is_none() && e.as_bytes().len() as u64 == READ_LIMIT => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes).map_err(|_| not_text())
        }
        Err(_) => Err(not_text()),
    }
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a char.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

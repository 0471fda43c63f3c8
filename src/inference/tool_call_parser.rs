//! Textual tool-call parsing for models without native tool calls.
//!
//! Two text formats are recognised (per `tool_call_format` in
//! `_models/config.yaml`):
//!
//! 1. **pythonic**
//!    ```text
//!    Tool: filesystem.list_dir
//!    Arguments: {"path": "/tmp"}
//!    ```
//!
//! 2. **bracket**
//!    ```text
//!    [filesystem.list_dir(path="/tmp")]
//!    <|tool_call_start|>[filesystem.list_dir(path="/tmp")]<|tool_call_end|>
//!    ```
//!
//! `native_json` models deliver tool calls in stream deltas, so their parser
//! never matches anything in the text.

use serde_json::{Map, Value};

use super::config::ToolCallFormat;
use super::types::ParsedToolCall;
use crate::agent_core::interfaces::TextualToolCallParser;

// ─── Format Dispatch ─────────────────────────────────────────────────────────

/// The textual parser for one model's configured format.
#[derive(Debug, Clone, Copy)]
pub struct FormatToolCallParser {
    format: ToolCallFormat,
}

impl FormatToolCallParser {
    pub fn new(format: ToolCallFormat) -> Self {
        Self { format }
    }
}

impl TextualToolCallParser for FormatToolCallParser {
    fn parse_all(&self, text: &str) -> Vec<ParsedToolCall> {
        match self.format {
            ToolCallFormat::NativeJson => Vec::new(),
            ToolCallFormat::Pythonic => parse_pythonic_tool_calls(text),
            ToolCallFormat::Bracket => parse_bracket_tool_calls(text),
        }
    }
}

// ─── Pythonic Format Parsing ─────────────────────────────────────────────────

/// Extract every `Tool:` / `Arguments:` pair from `text`.
///
/// A missing `Arguments:` line yields `{}`. The arguments text is passed
/// through unvalidated so a malformed object is reported when the tool runs.
pub fn parse_pythonic_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();
    let lines: Vec<&str> = text.lines().collect();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if let Some(name) = line.strip_prefix("Tool:").or_else(|| line.strip_prefix("tool:")) {
            let tool_name = name.trim();
            if tool_name.is_empty() {
                i += 1;
                continue;
            }

            let next_args = lines.get(i + 1).and_then(|next| {
                let next = next.trim();
                next.strip_prefix("Arguments:")
                    .or_else(|| next.strip_prefix("arguments:"))
                    .map(str::trim)
            });
            let arguments = match next_args {
                Some(args) => {
                    i += 1;
                    args.to_string()
                }
                None => "{}".to_string(),
            };

            calls.push(ParsedToolCall {
                name: tool_name.to_string(),
                arguments,
            });
        }

        i += 1;
    }

    calls
}

// ─── Bracket Format Parsing ─────────────────────────────────────────────────

/// Extract bracket-format calls. Special-token blocks win; bare
/// `[server.tool(...)]` expressions are the fallback.
pub fn parse_bracket_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let calls = parse_bracket_special_tokens(text);
    if !calls.is_empty() {
        return calls;
    }
    parse_bracket_bare(text)
}

fn parse_bracket_special_tokens(text: &str) -> Vec<ParsedToolCall> {
    const START_TAG: &str = "<|tool_call_start|>";
    const END_TAG: &str = "<|tool_call_end|>";

    let mut calls = Vec::new();
    let mut search_from = 0;

    while let Some(start_offset) = text[search_from..].find(START_TAG) {
        let abs_start = search_from + start_offset + START_TAG.len();
        let Some(end_offset) = text[abs_start..].find(END_TAG) else {
            break;
        };
        let block = text[abs_start..abs_start + end_offset].trim();
        search_from = abs_start + end_offset + END_TAG.len();

        let inner = block
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
            .unwrap_or(block);
        if let Some(call) = parse_bracket_expression(inner) {
            calls.push(call);
        }
    }

    calls
}

fn parse_bracket_bare(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'[' {
            i += 1;
            continue;
        }
        let Some(close) = find_matching_bracket(text, i) else {
            i += 1;
            continue;
        };
        let inner = &text[i + 1..close];
        if let Some(paren) = inner.find('(') {
            if is_dotted_tool_name(inner[..paren].trim()) {
                if let Some(call) = parse_bracket_expression(inner) {
                    calls.push(call);
                }
            }
        }
        i = close + 1;
    }

    calls
}

/// Suffixes that make `name.ext` a filename rather than a tool.
const FILE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "pdf", "doc", "docx", "xls", "xlsx",
    "txt", "md", "csv", "json", "xml", "yaml", "yml", "toml", "html", "css", "js", "ts", "py",
    "rs", "go", "zip", "tar", "gz", "mp3", "mp4", "wav", "mov", "log", "tmp",
];

/// `server.tool` with lowercase ASCII and underscores in both halves, where
/// the suffix is not a common file extension.
fn is_dotted_tool_name(name: &str) -> bool {
    let Some((server, tool)) = name.split_once('.') else {
        return false;
    };
    if server.is_empty() || tool.is_empty() || tool.contains('.') {
        return false;
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c == '_';
    server.chars().all(valid_char)
        && tool.chars().all(valid_char)
        && !FILE_EXTENSIONS.contains(&tool)
}

/// Index of the `]` matching the `[` at `start`, ignoring brackets inside
/// quoted strings.
fn find_matching_bracket(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if let Some(q) = quote {
            if b == q && bytes[i - 1] != b'\\' {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'[' => depth += 1,
            b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse `server.tool(key="value", n=1)` or a bare `server.tool`.
fn parse_bracket_expression(expr: &str) -> Option<ParsedToolCall> {
    let expr = expr.trim();
    let (name, args) = match expr.find('(') {
        Some(paren) => {
            let args = expr[paren + 1..].strip_suffix(')').unwrap_or(&expr[paren + 1..]);
            (expr[..paren].trim(), parse_bracket_args(args))
        }
        None => (expr, Value::Object(Map::new())),
    };
    if name.is_empty() {
        return None;
    }
    Some(ParsedToolCall {
        name: name.to_string(),
        arguments: args.to_string(),
    })
}

/// Python-style kwargs to a JSON object. Raw JSON objects are accepted as-is.
fn parse_bracket_args(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<Value>(raw) {
            return v;
        }
    }

    let mut map = Map::new();
    let mut remaining = raw;

    loop {
        remaining = remaining.trim_start_matches([',', ' ']).trim();
        if remaining.is_empty() {
            break;
        }
        let Some(eq_idx) = remaining.find('=') else {
            break;
        };
        let key = remaining[..eq_idx].trim().trim_matches('"').trim_matches('\'');
        let (value, rest) = parse_bracket_value(&remaining[eq_idx + 1..]);
        map.insert(key.to_string(), value);
        remaining = rest;
    }

    Value::Object(map)
}

/// Parse one kwarg value, returning it with the unparsed remainder.
fn parse_bracket_value(input: &str) -> (Value, &str) {
    let input = input.trim();

    if let Some(quote) = input.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let mut escaped = false;
        for (offset, ch) in input[1..].char_indices() {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                let end = 1 + offset;
                return (Value::String(input[1..end].to_string()), &input[end + 1..]);
            }
        }
        return (Value::String(input[1..].to_string()), "");
    }

    let end_idx = input.find(',').unwrap_or(input.len());
    let val_str = input[..end_idx].trim().trim_end_matches(')');
    let rest = &input[end_idx..];

    if let Ok(n) = val_str.parse::<i64>() {
        return (Value::Number(n.into()), rest);
    }
    if let Some(num) = val_str.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return (Value::Number(num), rest);
    }
    match val_str.to_lowercase().as_str() {
        "true" => (Value::Bool(true), rest),
        "false" => (Value::Bool(false), rest),
        "none" | "null" => (Value::Null, rest),
        _ => (Value::String(val_str.to_string()), rest),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

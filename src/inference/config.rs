//! Model configuration loading and validation.
//!
//! Reads `_models/config.yaml` and resolves environment variables. The file
//! is the single source of truth for model endpoints, tool-call formats and
//! the fallback chain.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// Env var that pins the project root used to find `_models/config.yaml`.
pub const PROJECT_ROOT_ENV: &str = "LOCALCHAT_PROJECT_ROOT";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which tool-call format the model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallFormat {
    /// Standard OpenAI JSON tool calls in the stream deltas.
    NativeJson,
    /// `Tool: name` / `Arguments: {...}` lines in the text.
    Pythonic,
    /// `[server.tool(k="v")]`, optionally wrapped in `<|tool_call_start|>` tokens.
    Bracket,
}

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default)]
    pub model_name: Option<String>,
    pub base_url: String,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    pub tool_call_format: ToolCallFormat,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_runtime() -> String {
    "ollama".to_string()
}
fn default_context_window() -> u32 {
    8192
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}

/// Top-level model registry (mirrors `_models/config.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub active_model: String,
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// Model keys in the order a request should try them: the active model
    /// first, then the fallback chain, without duplicates or unknown keys.
    pub fn attempt_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.active_model).chain(self.fallback_chain.iter());
        for key in candidates {
            if self.models.contains_key(key) && !order.contains(key) {
                order.push(key.clone());
            }
        }
        order
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Search upward from `start` for `_models/config.yaml`, honouring
/// `LOCALCHAT_PROJECT_ROOT` first.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(root) = std::env::var(PROJECT_ROOT_ENV) {
        let candidate = PathBuf::from(&root).join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join("_models/config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: "could not find _models/config.yaml".into(),
    })
}

/// Load and parse the models configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_models_config(path: &Path) -> Result<ModelsConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_models_config(&raw)
}

pub fn parse_models_config(raw: &str) -> Result<ModelsConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    let config: ModelsConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    if config.attempt_order().is_empty() {
        return Err(InferenceError::ConfigError {
            reason: format!(
                "active model '{}' not found in config and no fallback available",
                config.active_model
            ),
        });
    }
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
active_model: qwen
models:
  qwen:
    display_name: "Qwen"
    base_url: "${__LOCALCHAT_TEST_URL__:-http://localhost:11434/v1}"
    tool_call_format: native_json
  lfm:
    display_name: "LFM"
    base_url: "http://localhost:8080/v1"
    tool_call_format: bracket
    temperature: 0.1
fallback_chain:
  - qwen
  - lfm
  - missing
"#;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__LOCALCHAT_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__LOCALCHAT_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/Documents");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/Documents"));
    }

    #[test]
    fn test_parse_sample_applies_defaults() {
        let config = parse_models_config(SAMPLE).unwrap();
        let qwen = &config.models["qwen"];
        assert_eq!(qwen.base_url, "http://localhost:11434/v1");
        assert_eq!(qwen.runtime, "ollama");
        assert_eq!(qwen.max_tokens, 2048);
        assert_eq!(config.models["lfm"].tool_call_format, ToolCallFormat::Bracket);
    }

    #[test]
    fn test_attempt_order_dedups_and_skips_unknown() {
        let config = parse_models_config(SAMPLE).unwrap();
        assert_eq!(config.attempt_order(), vec!["qwen".to_string(), "lfm".to_string()]);
    }

    #[test]
    fn test_unknown_active_model_without_fallback_is_rejected() {
        let yaml = "active_model: nope\nmodels: {}\n";
        assert!(parse_models_config(yaml).is_err());
    }

    #[test]
    fn test_find_config_path_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("_models")).unwrap();
        std::fs::write(dir.path().join("_models/config.yaml"), SAMPLE).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert!(found.ends_with("_models/config.yaml"));
    }
}

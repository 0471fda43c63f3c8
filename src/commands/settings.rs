//! Turn engine settings persisted in the data directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent_core::context::{DEFAULT_MAX_TURNS, DEFAULT_NOTICE_TIMEOUT};
use crate::agent_core::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::agent_core::TurnConfig;

/// User-tunable settings for the turn loop.
///
/// Persisted to `turn_settings.json` in the app data directory and read
/// once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TurnSettings {
    pub max_turns: u32,
    pub handshake_timeout_ms: u64,
    pub notice_timeout_ms: u64,
    /// System prompt for new chats. `None` uses the built-in prompt.
    pub system_prompt: Option<String>,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            notice_timeout_ms: DEFAULT_NOTICE_TIMEOUT.as_millis() as u64,
            system_prompt: None,
        }
    }
}

impl TurnSettings {
    /// Load from disk or return defaults.
    pub fn load_or_default() -> Self {
        Self::load_from(&Self::persist_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "loaded turn settings");
                    cfg
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse turn settings, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read turn settings, using defaults");
                Self::default()
            }
        }
    }

    /// Save to disk (atomic write).
    pub fn save(&self) {
        self.save_to(&Self::persist_path());
    }

    pub fn save_to(&self, path: &Path) {
        let content = match serde_json::to_string_pretty(self) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize turn settings");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, &content) {
            tracing::error!(error = %e, "failed to write turn settings temp file");
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            tracing::error!(error = %e, "failed to rename turn settings file");
            return;
        }
        tracing::debug!("saved turn settings");
    }

    /// The engine configuration these settings describe. Zero values fall
    /// back to the defaults.
    pub fn turn_config(&self) -> TurnConfig {
        let defaults = TurnConfig::default();
        let millis = |ms: u64, fallback: Duration| {
            if ms == 0 {
                fallback
            } else {
                Duration::from_millis(ms)
            }
        };
        TurnConfig {
            max_turns: if self.max_turns == 0 { defaults.max_turns } else { self.max_turns },
            handshake_timeout: millis(self.handshake_timeout_ms, defaults.handshake_timeout),
            notice_timeout: millis(self.notice_timeout_ms, defaults.notice_timeout),
        }
    }

    fn persist_path() -> PathBuf {
        crate::data_dir().join("turn_settings.json")
    }
}

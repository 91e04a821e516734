// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, assembled by merging all discovered YAML layers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub claude: ClaudeConfig,
    pub progress: ProgressConfig,
    pub attachments: AttachmentsConfig,
    pub storage: StorageConfig,
}

/// Telegram transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bot API token.  Usually supplied via the COURIER_BOT_TOKEN
    /// environment variable rather than a config file.
    pub token: String,
    /// Long-poll timeout for getUpdates, in seconds.
    pub poll_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            poll_timeout_secs: 30,
        }
    }
}

/// Backend agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
    /// Explicit path to the `claude` CLI binary.  When unset the binary is
    /// resolved from PATH.
    pub cli_path: Option<String>,
    /// Directories that bound all tool-driven file access.  Every project
    /// the bot works in must live under one of these roots.
    pub approved_directories: Vec<PathBuf>,
    /// Default model override.  When unset the backend's own default (or
    /// the model from ~/.claude/settings.json) applies.
    pub model: Option<String>,
    /// Seconds of inactivity after which a per-user backend connection is
    /// torn down.
    pub idle_timeout_secs: u64,
    /// Override for the backend state directory (default: ~/.claude).
    pub claude_dir: Option<PathBuf>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            cli_path: None,
            approved_directories: Vec::new(),
            model: None,
            idle_timeout_secs: 3600,
            claude_dir: None,
        }
    }
}

impl ClaudeConfig {
    /// The backend's state directory (`~/.claude` unless overridden).
    pub fn claude_dir(&self) -> PathBuf {
        self.claude_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
        })
    }

    /// Shared session index written by both the CLI and this bot.
    pub fn history_path(&self) -> PathBuf {
        self.claude_dir().join("history.jsonl")
    }

    /// Per-session transcript root: `<claude_dir>/projects/<slug>/<sid>.jsonl`.
    pub fn projects_dir(&self) -> PathBuf {
        self.claude_dir().join("projects")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.claude_dir().join("settings.json")
    }

    pub fn personal_skills_dir(&self) -> PathBuf {
        self.claude_dir().join("skills")
    }

    pub fn personal_commands_dir(&self) -> PathBuf {
        self.claude_dir().join("commands")
    }

    pub fn plugins_registry_path(&self) -> PathBuf {
        self.claude_dir().join("plugins").join("installed_plugins.json")
    }
}

/// Live progress message tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum seconds between edits of the progress message.
    pub edit_interval_secs: u64,
    /// Rendered-size threshold (chars) that triggers rollover to a fresh
    /// message.
    pub rollover_threshold: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            edit_interval_secs: 2,
            rollover_threshold: 4000,
        }
    }
}

/// Inbound media handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentsConfig {
    /// Sliding-window timeout for album coalescing, in milliseconds.
    pub album_timeout_ms: u64,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            album_timeout_ms: 1000,
        }
    }
}

/// Persisted bot state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path for the bot_sessions table.
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("courier.db"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Builds backend connection options with CLI-settings parity.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Everything the transport needs to establish one backend connection.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub cwd: PathBuf,
    /// Session id to resume, when known.
    pub resume: Option<String>,
    pub model: Option<String>,
    pub betas: Vec<String>,
    /// Roots the permission gate validates tool paths against.
    pub approved_roots: Vec<PathBuf>,
    /// Explicit path to the backend CLI binary.
    pub cli_path: Option<String>,
    /// Text appended to the backend's preset system prompt.
    pub system_prompt_append: String,
}

const TELEGRAM_PROMPT_APPEND: &str =
    "You are being accessed via Telegram. Keep responses concise for mobile reading.";

/// Constructs [`AgentOptions`], reading defaults from the backend's own
/// settings file.
#[derive(Debug, Clone)]
pub struct OptionsBuilder {
    settings_path: PathBuf,
    cli_path: Option<String>,
}

impl OptionsBuilder {
    pub fn new(settings_path: PathBuf, cli_path: Option<String>) -> Self {
        Self {
            settings_path,
            cli_path,
        }
    }

    /// Build options for one connection.  Model priority: explicit
    /// override > backend settings.json > backend default (None).
    pub fn build(
        &self,
        cwd: &Path,
        session_id: Option<&str>,
        model: Option<&str>,
        betas: &[String],
        approved_roots: &[PathBuf],
    ) -> AgentOptions {
        let resolved_model = model
            .map(str::to_string)
            .or_else(|| self.settings_model());

        AgentOptions {
            cwd: cwd.to_path_buf(),
            resume: session_id.map(str::to_string),
            model: resolved_model,
            betas: betas.to_vec(),
            approved_roots: approved_roots.to_vec(),
            cli_path: self.cli_path.clone(),
            system_prompt_append: TELEGRAM_PROMPT_APPEND.to_string(),
        }
    }

    /// The `model` field from the backend's settings.json, if readable.
    fn settings_model(&self) -> Option<String> {
        let content = std::fs::read_to_string(&self.settings_path).ok()?;
        match serde_json::from_str::<Value>(&content) {
            Ok(settings) => settings
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                warn!(path = %self.settings_path.display(), error = %e, "failed to parse backend settings");
                None
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Connection to the backend CLI over stream-json stdio.
//!
//! The backend runs as a long-lived `claude` subprocess with newline-
//! delimited JSON on both stdin and stdout.  User turns are written as
//! `user` messages; the backend streams complete and partial events back
//! and answers `control_request` records (permission checks) that the
//! worker resolves inline.  `CLAUDECODE` is cleared in the child's
//! environment so the CLI does not refuse to start when the bot itself
//! runs inside an agent session.

use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::{debug, warn};

use crate::boundary::PermissionDecision;
use crate::error::ClaudeError;
use crate::options::AgentOptions;
use crate::types::ContentBlock;

/// One live backend connection.  Owned by a single worker task; every
/// operation on it happens in that task.
pub struct ClaudeProcess {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    request_seq: u64,
}

impl ClaudeProcess {
    /// Spawn the backend CLI and wire up the stream-json pipes.
    pub async fn connect(options: &AgentOptions) -> Result<Self, ClaudeError> {
        let program = options.cli_path.as_deref().unwrap_or("claude");

        let mut cmd = tokio::process::Command::new(program);
        cmd.arg("--input-format")
            .arg("stream-json")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages")
            .arg("--permission-mode")
            .arg("bypassPermissions")
            .arg("--append-system-prompt")
            .arg(&options.system_prompt_append);

        if let Some(model) = &options.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(resume) = &options.resume {
            cmd.arg("--resume").arg(resume);
        }
        if !options.betas.is_empty() {
            cmd.arg("--betas").arg(options.betas.join(","));
        }

        cmd.current_dir(&options.cwd)
            // Clear so the bundled CLI starts inside an existing agent session.
            .env("CLAUDECODE", "")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ClaudeError::BackendConnect(format!("spawning {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClaudeError::BackendConnect("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClaudeError::BackendConnect("failed to capture stdout".into()))?;

        // Drain stderr in the background so the child never blocks on a
        // full pipe; each line surfaces in our logs.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line.trim_end(), "backend stderr");
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            request_seq: 0,
        })
    }

    /// Submit one user turn as a list of content blocks.
    pub async fn send_user_message(&mut self, blocks: &[ContentBlock]) -> Result<(), ClaudeError> {
        let message = json!({
            "type": "user",
            "message": {"role": "user", "content": blocks},
        });
        self.write_line(&message).await
    }

    /// Read the next raw backend event.  `Ok(None)` means the stream
    /// ended (the child exited or closed stdout).
    pub async fn next_event(&mut self) -> Result<Option<Value>, ClaudeError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ClaudeError::QueryFailed(format!("reading backend stream: {e}")))?;
            let Some(line) = line else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    // Parse failures are dropped; the stream keeps going.
                    warn!(error = %e, "dropping unparseable backend line");
                    continue;
                }
            }
        }
    }

    /// Forward an interrupt to the in-flight query.
    pub async fn interrupt(&mut self) -> Result<(), ClaudeError> {
        self.request_seq += 1;
        let request = json!({
            "type": "control_request",
            "request_id": format!("req_{}", self.request_seq),
            "request": {"subtype": "interrupt"},
        });
        self.write_line(&request).await
    }

    /// Answer a `can_use_tool` control request.
    pub async fn respond_permission(
        &mut self,
        request_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), ClaudeError> {
        let behavior = match decision {
            PermissionDecision::Allow => json!({"behavior": "allow", "updatedInput": null}),
            PermissionDecision::Deny { message } => {
                json!({"behavior": "deny", "message": message})
            }
        };
        let response = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": request_id,
                "response": behavior,
            },
        });
        self.write_line(&response).await
    }

    /// Best-effort teardown: close stdin so the CLI exits, then reap.
    pub async fn disconnect(mut self) {
        let _ = self.stdin.shutdown().await;
        drop(self.stdin);
        match tokio::time::timeout(std::time::Duration::from_secs(5), self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
            }
        }
    }

    async fn write_line(&mut self, value: &Value) -> Result<(), ClaudeError> {
        let mut line = value.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClaudeError::QueryFailed(format!("writing to backend: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ClaudeError::QueryFailed(format!("flushing backend stdin: {e}")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

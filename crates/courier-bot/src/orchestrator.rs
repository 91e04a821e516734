// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Routes inbound updates to the session runtime and drives the progress
//! surface.
//!
//! One orchestrator serves all users.  Commands and callbacks mutate
//! lightweight per-user state (current directory, fresh-session flag);
//! everything conversational funnels into [`run_user_query`], which owns
//! the progress message, the typing heartbeat, history appends, and the
//! fallback reply chain (HTML → plain text → terse error).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_claude::client::QueryEvent;
use courier_claude::history::{append_history_entry, history_health};
use courier_claude::manager::ClientManager;
use courier_claude::types::Query;
use courier_config::Config;
use courier_skills::{discover_skills, load_skill_body, resolve_skill_prompt, DiscoveryPaths};

use crate::api::{ChatApi, InlineButton, Update};
use crate::attachments::{AttachmentProcessor, MediaGroupCollector};
use crate::html::{escape_html, markdown_to_telegram_html, relative_time};
use crate::progress::ProgressManager;

/// Snippet length used for history display fields.
const DISPLAY_SNIPPET_CHARS: usize = 50;
/// Typing indicator cadence while a query runs.
const TYPING_INTERVAL: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    api: Arc<dyn ChatApi>,
    manager: Arc<ClientManager>,
    config: Arc<Config>,
    collector: MediaGroupCollector,
    attachments: AttachmentProcessor,
    /// Per-user working directory; defaults to the first approved root.
    directories: StdMutex<HashMap<i64, PathBuf>>,
    /// Users whose next submission starts a fresh session.
    force_new: StdMutex<HashSet<i64>>,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn ChatApi>, manager: Arc<ClientManager>, config: Arc<Config>) -> Arc<Self> {
        let collector =
            MediaGroupCollector::new(Duration::from_millis(config.attachments.album_timeout_ms));
        Arc::new(Self {
            attachments: AttachmentProcessor::new(api.clone()),
            api,
            manager,
            collector,
            config,
            directories: StdMutex::new(HashMap::new()),
            force_new: StdMutex::new(HashSet::new()),
        })
    }

    /// Entry point for every inbound update.
    pub async fn handle_update(self: &Arc<Self>, update: Update) {
        if let Some(callback) = update.callback_query.clone() {
            self.handle_callback(callback).await;
            return;
        }

        let Some(message) = update.message.clone() else {
            return;
        };
        let Some(user) = message.from.clone() else {
            return;
        };

        // Commands bypass album handling entirely.
        if let Some(text) = message.text.as_deref() {
            if text.starts_with('/') {
                self.handle_command(user.id, message.chat.id, text).await;
                return;
            }
        }

        let group_id = message.media_group_id.clone();
        match self.collector.add(update).await {
            Some(batch) => self.process_batch(batch).await,
            None => {
                // Album member buffered; wait out the window, then fetch
                // the batch exactly once (only one waiter wins the pop).
                let orchestrator = self.clone();
                let group_id = group_id.unwrap_or_default();
                let wait = Duration::from_millis(self.config.attachments.album_timeout_ms + 200);
                tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    if let Some(batch) = orchestrator.collector.pop_ready(&group_id).await {
                        orchestrator.process_batch(batch).await;
                    }
                });
            }
        }
    }

    /// Turn a coalesced batch into one Query and run it.
    async fn process_batch(self: &Arc<Self>, batch: Vec<Update>) {
        let messages: Vec<_> = batch.into_iter().filter_map(|u| u.message).collect();
        let Some(first) = messages.first() else {
            return;
        };
        let Some(user) = first.from.clone() else {
            return;
        };
        let chat_id = first.chat.id;

        let text = messages
            .iter()
            .find_map(|m| m.text.clone().or_else(|| m.caption.clone()))
            .filter(|t| !t.is_empty());

        let mut attachments = Vec::new();
        for message in &messages {
            let processed = if let Some(photos) = &message.photo {
                self.attachments.process_photo(photos).await
            } else if let Some(doc) = &message.document {
                self.attachments.process_document(doc).await
            } else {
                continue;
            };
            match processed {
                Ok(att) => attachments.push(att),
                Err(e) => {
                    self.reply_plain(chat_id, &e.to_string()).await;
                    return;
                }
            }
        }

        if text.is_none() && attachments.is_empty() {
            return;
        }

        let query = Query { text, attachments };
        self.run_user_query(user.id, chat_id, query).await;
    }

    // ── Query flow ────────────────────────────────────────────────────────────

    async fn run_user_query(self: &Arc<Self>, user_id: i64, chat_id: i64, query: Query) {
        let directory = self.current_directory(user_id);
        let force_new = {
            let mut flags = lock(&self.force_new);
            flags.remove(&user_id)
        };
        let display: String = query
            .text
            .as_deref()
            .unwrap_or("(attachment)")
            .chars()
            .take(DISPLAY_SNIPPET_CHARS)
            .collect();

        // A resume is in play when any session is resolvable; a failed
        // resume gets exactly one forced-fresh retry.
        let had_resume = !force_new
            && (self
                .manager
                .get_active_client(user_id)
                .and_then(|c| c.session_id())
                .is_some()
                || self.manager.get_latest_session(&directory).is_some());

        let progress_seed = match self.api.send_message(chat_id, "Working...", false).await {
            Ok(m) => m,
            Err(e) => {
                warn!(user_id, error = %e, "failed to send progress message");
                return;
            }
        };

        let mut progress = ProgressManager::new(
            self.api.clone(),
            progress_seed,
            Duration::from_secs(self.config.progress.edit_interval_secs),
            self.config.progress.rollover_threshold,
        );

        // Independent heartbeat so the chat shows activity even while a
        // single long tool call produces no stream events.
        let heartbeat = {
            let api = self.api.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(TYPING_INTERVAL).await;
                    let _ = api.send_chat_action(chat_id, "typing").await;
                }
            })
        };

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<QueryEvent>();
        let pump = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                progress.update(&event).await;
            }
            progress
        });

        let approved = self.config.claude.approved_directories.clone();
        let mut result = self
            .manager
            .run_query(
                user_id,
                &directory,
                query.clone(),
                &approved,
                force_new,
                Some(events_tx),
            )
            .await;

        if result.is_err() && had_resume {
            warn!(user_id, "session resume failed; retrying with a fresh session");
            let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<QueryEvent>();
            // Discard retry progress events; the original pump has ended.
            tokio::spawn(async move { while retry_rx.recv().await.is_some() {} });
            result = self
                .manager
                .run_query(user_id, &directory, query, &approved, true, Some(retry_tx))
                .await;
        }

        heartbeat.abort();
        let mut progress = match pump.await {
            Ok(p) => p,
            Err(_) => return,
        };
        progress.finalize().await;

        match result {
            Ok(result) => {
                if let Some(sid) = &result.session_id {
                    append_history_entry(
                        &self.config.claude.history_path(),
                        sid,
                        &display,
                        &directory.display().to_string(),
                    );
                }
                let text = if result.response_text.is_empty() {
                    "(no response)".to_string()
                } else {
                    result.response_text
                };
                self.reply(chat_id, &text).await;
                info!(user_id, cost = result.cost, num_turns = result.num_turns, "query finished");
            }
            Err(e) => {
                self.reply_plain(chat_id, &format!("Query failed: {e}")).await;
            }
        }
    }

    /// HTML reply with plain-text fallback; the last resort is a terse
    /// error so the user is never left without an answer.
    async fn reply(&self, chat_id: i64, markdown: &str) {
        let html = markdown_to_telegram_html(markdown);
        if self.api.send_message(chat_id, &html, true).await.is_ok() {
            return;
        }
        debug!(chat_id, "HTML reply failed; falling back to plain text");
        self.reply_plain(chat_id, markdown).await;
    }

    async fn reply_plain(&self, chat_id: i64, text: &str) {
        if self.api.send_message(chat_id, text, false).await.is_err() {
            let _ = self
                .api
                .send_message(chat_id, "Something went wrong.", false)
                .await;
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn handle_command(self: &Arc<Self>, user_id: i64, chat_id: i64, text: &str) {
        let (command, _args) = match text.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (text, ""),
        };
        // Commands may arrive as /cmd@botname in group chats.
        let command = command.split('@').next().unwrap_or(command);

        match command {
            "/start" => {
                self.reply_plain(
                    chat_id,
                    "Connected to the coding agent.\n\n\
                     Send a message to start working. Commands:\n\
                     /new — start a fresh session\n\
                     /status — session status\n\
                     /sessions — resume a recent session\n\
                     /skills — run a skill\n\
                     /model — pick a model\n\
                     /repo — change project directory\n\
                     /stop — interrupt the running query",
                )
                .await;
            }
            "/new" => {
                self.manager.disconnect(user_id).await;
                lock(&self.force_new).insert(user_id);
                self.reply_plain(chat_id, "Next message starts a fresh session.").await;
            }
            "/stop" => {
                self.manager.interrupt(user_id).await;
                self.reply_plain(chat_id, "Interrupt sent.").await;
            }
            "/status" => self.command_status(user_id, chat_id).await,
            "/sessions" => self.command_sessions(user_id, chat_id).await,
            "/skills" => self.command_skills(user_id, chat_id).await,
            "/model" => self.command_model(chat_id).await,
            "/repo" => self.command_repo(chat_id).await,
            _ => {
                self.reply_plain(chat_id, "Unknown command. Try /start.").await;
            }
        }
    }

    async fn command_status(&self, user_id: i64, chat_id: i64) {
        let directory = self.current_directory(user_id);
        let client = self.manager.get_active_client(user_id);
        let session = client
            .as_ref()
            .and_then(|c| c.session_id())
            .or_else(|| self.manager.get_latest_session(&directory));
        let model = client.as_ref().and_then(|c| c.model());

        let mut lines = vec![
            format!("Directory: {}", directory.display()),
            format!("Session: {}", session.as_deref().unwrap_or("(none)")),
            format!("Model: {}", model.as_deref().unwrap_or("(default)")),
        ];
        match &client {
            Some(c) if c.is_querying() => lines.push("State: querying".into()),
            Some(c) if c.is_connected() => lines.push("State: connected (idle)".into()),
            _ => lines.push("State: disconnected".into()),
        }
        if let Some(warning) = history_health(&self.config.claude.history_path()) {
            lines.push(format!("⚠️ {warning}"));
        }
        self.reply_plain(chat_id, &lines.join("\n")).await;
    }

    async fn command_sessions(&self, user_id: i64, chat_id: i64) {
        let directory = self.current_directory(user_id);
        let entries = self.manager.list_sessions(&directory, 10);

        let mut keyboard: Vec<Vec<InlineButton>> = entries
            .iter()
            .map(|e| {
                let snippet: String = e.display.chars().take(30).collect();
                let label = format!("{snippet} · {}", relative_time(e.timestamp));
                vec![InlineButton::new(label, format!("session:{}", e.session_id))]
            })
            .collect();
        keyboard.push(vec![InlineButton::new("+ New Session", "session:new")]);

        let title = if entries.is_empty() {
            format!("No sessions found in {}. Start a new one:", directory.display())
        } else {
            format!("Recent sessions in {}:", directory.display())
        };
        if self
            .api
            .send_message_with_keyboard(chat_id, &title, false, &keyboard)
            .await
            .is_err()
        {
            self.reply_plain(chat_id, &title).await;
        }
    }

    async fn command_skills(&self, user_id: i64, chat_id: i64) {
        let skills = discover_skills(&self.discovery_paths(user_id));
        if skills.is_empty() {
            self.reply_plain(chat_id, "No skills found.").await;
            return;
        }
        let keyboard: Vec<Vec<InlineButton>> = skills
            .iter()
            .map(|s| vec![InlineButton::new(&s.name, format!("skill:{}", s.name))])
            .collect();
        let _ = self
            .api
            .send_message_with_keyboard(chat_id, "Available skills:", false, &keyboard)
            .await;
    }

    async fn command_model(&self, chat_id: i64) {
        let keyboard = vec![
            vec![
                InlineButton::new("Sonnet", "model:sonnet"),
                InlineButton::new("Opus", "model:opus"),
                InlineButton::new("Haiku", "model:haiku"),
            ],
            vec![
                InlineButton::new("Sonnet 1M", "model:sonnet:1m"),
                InlineButton::new("Opus 1M", "model:opus:1m"),
            ],
        ];
        let _ = self
            .api
            .send_message_with_keyboard(chat_id, "Select a model:", false, &keyboard)
            .await;
    }

    async fn command_repo(&self, chat_id: i64) {
        let mut keyboard = Vec::new();
        for root in &self.config.claude.approved_directories {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.display().to_string());
            keyboard.push(vec![InlineButton::new(
                name,
                format!("nav:{}", root.display()),
            )]);
        }
        if keyboard.is_empty() {
            self.reply_plain(chat_id, "No approved directories configured.").await;
            return;
        }
        let _ = self
            .api
            .send_message_with_keyboard(chat_id, "Pick a project root:", false, &keyboard)
            .await;
    }

    // ── Callbacks ─────────────────────────────────────────────────────────────

    async fn handle_callback(self: &Arc<Self>, callback: crate::api::CallbackQuery) {
        let _ = self.api.answer_callback(&callback.id).await;
        let Some(data) = callback.data.as_deref() else {
            return;
        };
        let user_id = callback.from.id;
        let chat_id = callback
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(user_id);

        if let Some(path) = data.strip_prefix("cd:").or_else(|| data.strip_prefix("sel:")) {
            self.callback_cd(user_id, chat_id, path).await;
        } else if let Some(path) = data.strip_prefix("nav:") {
            self.callback_nav(chat_id, path).await;
        } else if let Some(session) = data.strip_prefix("session:") {
            self.callback_session(user_id, chat_id, session).await;
        } else if let Some(skill) = data.strip_prefix("skill:") {
            self.callback_skill(user_id, chat_id, skill).await;
        } else if let Some(model) = data.strip_prefix("model:") {
            self.callback_model(user_id, chat_id, model).await;
        } else {
            debug!(data, "unhandled callback");
        }
    }

    async fn callback_cd(&self, user_id: i64, chat_id: i64, path: &str) {
        let target = PathBuf::from(path);
        if !self.is_approved(&target) {
            self.reply_plain(chat_id, "That directory is outside the approved roots.").await;
            return;
        }
        lock(&self.directories).insert(user_id, target.clone());
        info!(user_id, directory = %target.display(), "working directory changed");
        self.reply_plain(chat_id, &format!("Working directory: {}", target.display())).await;
    }

    async fn callback_nav(&self, chat_id: i64, path: &str) {
        let dir = PathBuf::from(path);
        if !self.is_approved(&dir) {
            self.reply_plain(chat_id, "That directory is outside the approved roots.").await;
            return;
        }

        let mut keyboard = vec![vec![InlineButton::new(
            "· use this directory ·",
            format!("cd:{}", dir.display()),
        )]];
        if let Ok(entries) = std::fs::read_dir(&dir) {
            let mut subdirs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.is_dir()
                        && p.file_name()
                            .map(|n| !n.to_string_lossy().starts_with('.'))
                            .unwrap_or(false)
                })
                .collect();
            subdirs.sort();
            for sub in subdirs.into_iter().take(20) {
                let name = sub
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                keyboard.push(vec![InlineButton::new(
                    format!("{name}/"),
                    format!("nav:{}", sub.display()),
                )]);
            }
        }
        let _ = self
            .api
            .send_message_with_keyboard(chat_id, &format!("{}:", dir.display()), false, &keyboard)
            .await;
    }

    async fn callback_session(self: &Arc<Self>, user_id: i64, chat_id: i64, session: &str) {
        if session == "new" {
            self.manager.disconnect(user_id).await;
            lock(&self.force_new).insert(user_id);
            self.reply_plain(chat_id, "Next message starts a fresh session.").await;
            return;
        }
        let directory = self.current_directory(user_id);
        let approved = self.config.claude.approved_directories.clone();
        match self
            .manager
            .switch_session(user_id, session, &directory, None, None, &approved)
            .await
        {
            Ok(_) => {
                self.reply_plain(chat_id, &format!("Resumed session {session}.")).await;
            }
            Err(e) => {
                self.reply_plain(chat_id, &format!("Failed to resume session: {e}")).await;
            }
        }
    }

    async fn callback_skill(self: &Arc<Self>, user_id: i64, chat_id: i64, name: &str) {
        let skills = discover_skills(&self.discovery_paths(user_id));
        let Some(skill) = skills.iter().find(|s| s.name == name) else {
            self.reply_plain(
                chat_id,
                &format!("Failed to load skill: {}", escape_html(name)),
            )
            .await;
            return;
        };

        let body = load_skill_body(skill);
        if body.is_empty() {
            self.reply_plain(chat_id, &format!("Skill {name} has no content.")).await;
            return;
        }

        let session_id = self
            .manager
            .get_active_client(user_id)
            .and_then(|c| c.session_id())
            .unwrap_or_default();
        let prompt = resolve_skill_prompt(&body, "", &session_id);

        self.reply_plain(chat_id, &format!("Running skill: {name}...")).await;
        self.run_user_query(user_id, chat_id, Query::text(prompt)).await;
    }

    async fn callback_model(&self, user_id: i64, chat_id: i64, spec: &str) {
        let (model, betas) = match spec.strip_suffix(":1m") {
            Some(model) => (model, Some(vec!["context-1m".to_string()])),
            None => (spec, None),
        };
        self.manager.set_model(user_id, model, betas.clone());
        let suffix = if betas.is_some() { " (1M context)" } else { "" };
        self.reply_plain(chat_id, &format!("Model set to {model}{suffix}.")).await;
    }

    // ── Per-user state ────────────────────────────────────────────────────────

    fn current_directory(&self, user_id: i64) -> PathBuf {
        if let Some(dir) = lock(&self.directories).get(&user_id) {
            return dir.clone();
        }
        self.config
            .claude
            .approved_directories
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn is_approved(&self, path: &Path) -> bool {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.config.claude.approved_directories.iter().any(|root| {
            let root = root.canonicalize().unwrap_or_else(|_| root.clone());
            resolved.starts_with(&root)
        })
    }

    fn discovery_paths(&self, user_id: i64) -> DiscoveryPaths {
        let claude = &self.config.claude;
        DiscoveryPaths {
            project_dir: self.current_directory(user_id),
            personal_skills_dir: claude.personal_skills_dir(),
            personal_commands_dir: claude.personal_commands_dir(),
            plugins_registry: claude.plugins_registry_path(),
            settings: claude.settings_path(),
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

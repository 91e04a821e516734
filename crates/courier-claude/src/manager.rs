// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registry of per-user actors plus session resolution and persistence.
//!
//! Exactly one [`UserClient`] per user id lives in the registry.  Worker
//! exits are reported on an internal channel and a reaper task removes
//! the entry — an exiting actor never mutates persistence itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_storage::SessionStore;

use crate::client::{QueryEvent, QueryResult, UserClient};
use crate::error::ClaudeError;
use crate::history::{HistoryEntry, SessionResolver};
use crate::options::OptionsBuilder;
use crate::types::Query;

type Registry = Arc<StdMutex<HashMap<i64, Arc<UserClient>>>>;

/// Owns the user → client mapping and resolves session state.
pub struct ClientManager {
    registry: Registry,
    store: Arc<SessionStore>,
    options: OptionsBuilder,
    resolver: SessionResolver,
    idle_timeout: Duration,
    epoch_seq: AtomicU64,
    exit_tx: mpsc::UnboundedSender<(i64, u64)>,
}

impl ClientManager {
    pub fn new(
        store: Arc<SessionStore>,
        options: OptionsBuilder,
        resolver: SessionResolver,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(i64, u64)>();

        // Reaper: removes registry entries for exited workers.  The epoch
        // guard ensures a stale exit cannot evict a replacement client.
        let reaper_registry = registry.clone();
        tokio::spawn(async move {
            while let Some((user_id, epoch)) = exit_rx.recv().await {
                let mut reg = lock(&reaper_registry);
                if reg.get(&user_id).is_some_and(|c| c.epoch() == epoch) {
                    reg.remove(&user_id);
                    info!(user_id, "client removed from registry after exit");
                }
            }
        });

        Arc::new(Self {
            registry,
            store,
            options,
            resolver,
            idle_timeout,
            epoch_seq: AtomicU64::new(1),
            exit_tx,
        })
    }

    /// Get the existing client for this user, or build, connect and
    /// register a new one.
    ///
    /// Session resolution priority (skipped entirely under `force_new`):
    /// explicit argument, then the persisted row (only when its directory
    /// matches, also inheriting model/betas when not overridden), then
    /// the newest history entry for the directory.
    #[allow(clippy::too_many_arguments)]
    pub async fn get_or_connect(
        &self,
        user_id: i64,
        directory: &Path,
        session_id: Option<&str>,
        model: Option<&str>,
        betas: Option<Vec<String>>,
        approved_roots: &[PathBuf],
        force_new: bool,
    ) -> Result<Arc<UserClient>, ClaudeError> {
        let existing = lock(&self.registry).get(&user_id).cloned();

        if let Some(existing) = existing {
            if existing.is_connected() && existing.directory == directory && !force_new {
                return Ok(existing);
            }
            existing.stop().await;
            lock(&self.registry).remove(&user_id);
        }

        let mut resolved_session = session_id.map(str::to_string);
        let mut resolved_model = model.map(str::to_string);
        let mut resolved_betas = betas;

        if resolved_session.is_none() && !force_new {
            match self.store.get_by_user(user_id) {
                Ok(Some(row)) if row.directory == directory.display().to_string() => {
                    resolved_session = Some(row.session_id);
                    if resolved_model.is_none() {
                        resolved_model = row.model;
                    }
                    if resolved_betas.is_none() {
                        resolved_betas = Some(row.betas);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    // Read errors only lose the persisted hint.
                    warn!(user_id, error = %e, "failed to read persisted session; continuing without");
                }
            }
        }

        if resolved_session.is_none() && !force_new {
            resolved_session = self.resolver.latest_session(directory);
        }

        let epoch = self.epoch_seq.fetch_add(1, Ordering::SeqCst);
        let exit_tx = self.exit_tx.clone();
        let betas_vec = resolved_betas.clone().unwrap_or_default();
        let client = Arc::new(UserClient::new(
            user_id,
            directory.to_path_buf(),
            resolved_session.clone(),
            resolved_model.clone(),
            betas_vec.clone(),
            self.idle_timeout,
            epoch,
            Arc::new(move |uid, ep| {
                let _ = exit_tx.send((uid, ep));
            }),
        ));

        let options = self.options.build(
            directory,
            resolved_session.as_deref(),
            resolved_model.as_deref(),
            &betas_vec,
            approved_roots,
        );
        client.start(options).await?;
        lock(&self.registry).insert(user_id, client.clone());

        if let Some(sid) = client.session_id() {
            if let Err(e) = self.store.upsert(
                user_id,
                &sid,
                &directory.display().to_string(),
                resolved_model.as_deref(),
                &betas_vec,
            ) {
                warn!(user_id, error = %e, "failed to persist session");
            }
        }

        info!(
            user_id,
            directory = %directory.display(),
            session_id = ?client.session_id(),
            "client connected"
        );
        Ok(client)
    }

    /// Stop the current client and connect to an explicit session.
    #[allow(clippy::too_many_arguments)]
    pub async fn switch_session(
        &self,
        user_id: i64,
        session_id: &str,
        directory: &Path,
        model: Option<&str>,
        betas: Option<Vec<String>>,
        approved_roots: &[PathBuf],
    ) -> Result<Arc<UserClient>, ClaudeError> {
        let existing = lock(&self.registry).remove(&user_id);
        if let Some(existing) = existing {
            existing.stop().await;
        }
        self.get_or_connect(
            user_id,
            directory,
            Some(session_id),
            model,
            betas,
            approved_roots,
            false,
        )
        .await
    }

    /// Forward an interrupt to the user's client, if one exists.
    pub async fn interrupt(&self, user_id: i64) {
        let client = lock(&self.registry).get(&user_id).cloned();
        if let Some(client) = client {
            client.interrupt().await;
        }
    }

    /// Update the in-memory model (and betas) and persist when a session
    /// id exists.  Database errors are logged and swallowed.
    pub fn set_model(&self, user_id: i64, model: &str, betas: Option<Vec<String>>) {
        let client = lock(&self.registry).get(&user_id).cloned();
        let Some(client) = client else {
            return;
        };
        client.set_model(model, betas);
        if let Some(sid) = client.session_id() {
            if let Err(e) = self.store.upsert(
                user_id,
                &sid,
                &client.directory.display().to_string(),
                Some(model),
                &client.betas(),
            ) {
                warn!(user_id, error = %e, "failed to persist model change");
            }
        }
    }

    /// Record the session id from a result event: update in-memory state
    /// and persist.  Database errors are logged and swallowed.
    pub fn update_session_id(&self, user_id: i64, session_id: &str) {
        let client = lock(&self.registry).get(&user_id).cloned();
        let Some(client) = client else {
            return;
        };
        client.set_session_id(session_id);
        if let Err(e) = self.store.upsert(
            user_id,
            session_id,
            &client.directory.display().to_string(),
            client.model().as_deref(),
            &client.betas(),
        ) {
            warn!(user_id, error = %e, "failed to persist session id");
        }
    }

    pub fn get_active_client(&self, user_id: i64) -> Option<Arc<UserClient>> {
        lock(&self.registry).get(&user_id).cloned()
    }

    pub fn get_latest_session(&self, directory: &Path) -> Option<String> {
        self.resolver.latest_session(directory)
    }

    pub fn list_sessions(&self, directory: &Path, limit: usize) -> Vec<HistoryEntry> {
        self.resolver.list_sessions(directory, limit)
    }

    /// Stop and remove one user's client.
    pub async fn disconnect(&self, user_id: i64) {
        let client = lock(&self.registry).remove(&user_id);
        if let Some(client) = client {
            client.stop().await;
        }
    }

    /// Stop all clients.  Called on shutdown.
    pub async fn disconnect_all(&self) {
        let user_ids: Vec<i64> = lock(&self.registry).keys().copied().collect();
        for user_id in user_ids {
            self.disconnect(user_id).await;
        }
    }

    /// Convenience wrapper: resolve or reuse a client, submit, and report
    /// the result.  Used by the orchestrator's query path.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_query(
        &self,
        user_id: i64,
        directory: &Path,
        query: Query,
        approved_roots: &[PathBuf],
        force_new: bool,
        events: Option<mpsc::UnboundedSender<QueryEvent>>,
    ) -> Result<QueryResult, ClaudeError> {
        let client = self
            .get_or_connect(
                user_id,
                directory,
                None,
                None,
                None,
                approved_roots,
                force_new,
            )
            .await?;
        let result = client.submit(query, events).await?;
        if let Some(sid) = &result.session_id {
            self.update_session_id(user_id, sid);
        }
        debug!(user_id, num_turns = result.num_turns, cost = result.cost, "query completed");
        Ok(result)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! SQLite-backed persistence for per-user bot session state.
//!
//! Exactly one row per Telegram user.  A row is written only once the
//! backend has produced a session id, so the table never contains
//! placeholder sessions.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// One persisted session binding for a user.
#[derive(Debug, Clone, PartialEq)]
pub struct BotSession {
    pub user_id: i64,
    pub session_id: String,
    pub directory: String,
    pub model: Option<String>,
    pub betas: Vec<String>,
    /// RFC 3339 timestamp of the last upsert.
    pub last_active: String,
}

/// Handle to the bot_sessions table.
///
/// rusqlite connections are not Sync; the mutex serializes access so the
/// store can be shared across tasks.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bot_sessions (
                user_id INTEGER PRIMARY KEY,
                session_id TEXT NOT NULL,
                directory TEXT NOT NULL,
                model TEXT,
                betas TEXT NOT NULL DEFAULT '[]',
                last_active TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens after a panic in another holder;
        // the inner connection is still usable for our single-statement ops.
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or update the row for `user_id`.
    pub fn upsert(
        &self,
        user_id: i64,
        session_id: &str,
        directory: &str,
        model: Option<&str>,
        betas: &[String],
    ) -> Result<()> {
        let betas_json = serde_json::to_string(betas)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO bot_sessions (user_id, session_id, directory, model, betas, last_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                session_id = excluded.session_id,
                directory = excluded.directory,
                model = excluded.model,
                betas = excluded.betas,
                last_active = excluded.last_active
            "#,
            params![user_id, session_id, directory, model, betas_json, now],
        )?;
        Ok(())
    }

    pub fn get_by_user(&self, user_id: i64) -> Result<Option<BotSession>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT user_id, session_id, directory, model, betas, last_active
                 FROM bot_sessions WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(user_id, session_id, directory, model, betas, last_active)| BotSession {
                user_id,
                session_id,
                directory,
                model,
                // Rows written by older versions may carry malformed JSON.
                betas: serde_json::from_str(&betas).unwrap_or_default(),
                last_active,
            },
        ))
    }

    pub fn delete(&self, user_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM bot_sessions WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

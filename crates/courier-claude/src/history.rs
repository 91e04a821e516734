// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session index over the shared `history.jsonl` log.
//!
//! The log is written by both the backend CLI and this bot; every line is
//! an independent JSON object with `sessionId`, `display`, `timestamp`
//! (milliseconds) and `project`.  Appends from this process are
//! best-effort — a failed append must never fail a query.
//!
//! Session transcripts live in separate per-session files under
//! `<projects_root>/<slug>/<session>.jsonl` where the slug replaces every
//! `/` in the project path with `-`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// A single session entry from the shared history log.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub session_id: String,
    pub display: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub project: String,
}

/// Read and parse the history log.  Returns entries sorted newest first;
/// malformed lines are dropped with a warning.  A missing file is empty.
pub fn read_history(history_path: &Path) -> Vec<HistoryEntry> {
    let content = match fs::read_to_string(history_path) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %history_path.display(), "history file not found");
            return Vec::new();
        }
    };

    let mut entries = Vec::new();
    let mut malformed = 0usize;

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_history_line(line) {
            Some(entry) => entries.push(entry),
            None => {
                warn!(line_num = line_num + 1, "skipping malformed history line");
                malformed += 1;
            }
        }
    }

    if malformed > 0 {
        debug!(count = malformed, kept = entries.len(), "dropped malformed history entries");
    }

    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

fn parse_history_line(line: &str) -> Option<HistoryEntry> {
    let data: Value = serde_json::from_str(line).ok()?;
    Some(HistoryEntry {
        session_id: data.get("sessionId")?.as_str()?.to_string(),
        display: data.get("display")?.as_str()?.to_string(),
        timestamp: data.get("timestamp")?.as_i64()?,
        project: data.get("project")?.as_str()?.to_string(),
    })
}

/// Keep entries whose project canonicalizes to the same path as
/// `directory` (string equality as fallback).  Preserves order.
pub fn filter_by_directory(entries: &[HistoryEntry], directory: &Path) -> Vec<HistoryEntry> {
    let resolved_dir = directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf());
    let resolved_str = resolved_dir.display().to_string();

    entries
        .iter()
        .filter(|e| {
            let project = Path::new(&e.project);
            match project.canonicalize() {
                Ok(p) => p == resolved_dir,
                Err(_) => e.project == resolved_str,
            }
        })
        .cloned()
        .collect()
}

/// Linear scan for a session id; first match wins.
pub fn find_session_by_id<'a>(
    entries: &'a [HistoryEntry],
    session_id: &str,
) -> Option<&'a HistoryEntry> {
    entries.iter().find(|e| e.session_id == session_id)
}

/// Returns a warning when more than half of the non-empty lines are
/// malformed.  A missing or empty file is healthy.
pub fn history_health(history_path: &Path) -> Option<String> {
    let content = fs::read_to_string(history_path).ok()?;

    let mut total = 0usize;
    let mut malformed = 0usize;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        total += 1;
        if parse_history_line(line).is_none() {
            malformed += 1;
        }
    }

    if total == 0 {
        return None;
    }

    let pct = (malformed as f64 / total as f64) * 100.0;
    if pct > 50.0 {
        let warning = format!(
            "History file has {pct:.1}% malformed entries ({malformed}/{total}). \
             Consider backing up and recreating the file."
        );
        warn!(%warning, "history health check failed");
        Some(warning)
    } else {
        None
    }
}

/// Append one entry so the CLI can discover bot sessions.  Best-effort:
/// failures are logged and swallowed.
pub fn append_history_entry(history_path: &Path, session_id: &str, display: &str, project: &str) {
    let entry = json!({
        "sessionId": session_id,
        "display": display,
        "timestamp": Utc::now().timestamp_millis(),
        "project": project,
    });

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = history_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(history_path)?;
        writeln!(file, "{entry}")
    })();

    match result {
        Ok(()) => debug!(session_id, project, "appended history entry"),
        Err(e) => warn!(path = %history_path.display(), error = %e, "failed to append history entry"),
    }
}

// ─── Session transcripts ─────────────────────────────────────────────────────

/// A user or assistant message from a session transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptMessage {
    /// "user" or "assistant".
    pub role: String,
    pub text: String,
}

/// The transcript directory slug for a project path.
fn project_slug(directory: &str) -> String {
    directory.replace('/', "-")
}

/// Read the tail of a session transcript: up to `2 × limit` of the most
/// recent non-empty user/assistant messages, oldest first.  Messages whose
/// text starts with `<` are system-injected and skipped.
pub fn read_session_transcript(
    projects_dir: &Path,
    session_id: &str,
    project_dir: &str,
    limit: usize,
) -> Vec<TranscriptMessage> {
    let path = projects_dir
        .join(project_slug(project_dir))
        .join(format!("{session_id}.jsonl"));

    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => {
            debug!(session_id, path = %path.display(), "session transcript not found");
            return Vec::new();
        }
    };

    let mut messages = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(role) = data.get("type").and_then(Value::as_str) else {
            continue;
        };
        if role != "user" && role != "assistant" {
            continue;
        }

        let text = transcript_text(data.get("message").and_then(|m| m.get("content")));
        if text.is_empty() || text.starts_with('<') {
            continue;
        }
        messages.push(TranscriptMessage {
            role: role.to_string(),
            text,
        });
    }

    let keep = limit.saturating_mul(2);
    if messages.len() > keep {
        messages.split_off(messages.len() - keep)
    } else {
        messages
    }
}

/// Transcript content is either a plain string or a list of blocks, of
/// which the first `text` block carries the message body.
fn transcript_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .and_then(|b| b.get("text").and_then(Value::as_str))
            .map(|t| t.trim().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

// ─── Resolver ────────────────────────────────────────────────────────────────

/// Resolves resumable session ids from the shared history log.
#[derive(Debug, Clone)]
pub struct SessionResolver {
    history_path: PathBuf,
}

impl SessionResolver {
    pub fn new(history_path: PathBuf) -> Self {
        Self { history_path }
    }

    /// The most recent session id for a directory, if any.
    pub fn latest_session(&self, directory: &Path) -> Option<String> {
        let entries = read_history(&self.history_path);
        filter_by_directory(&entries, directory)
            .first()
            .map(|e| e.session_id.clone())
    }

    /// Recent sessions for a directory, newest first, up to `limit`.
    pub fn list_sessions(&self, directory: &Path, limit: usize) -> Vec<HistoryEntry> {
        let entries = read_history(&self.history_path);
        let mut filtered = filter_by_directory(&entries, directory);
        filtered.truncate(limit);
        filtered
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_history(dir: &TempDir, lines: &[&str]) -> PathBuf {
        let path = dir.path().join("history.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    fn entry_line(sid: &str, display: &str, ts: i64, project: &str) -> String {
        json!({"sessionId": sid, "display": display, "timestamp": ts, "project": project})
            .to_string()
    }

    // ── Reading ───────────────────────────────────────────────────────────────

    #[test]
    fn missing_file_reads_empty() {
        assert!(read_history(Path::new("/nonexistent/history.jsonl")).is_empty());
    }

    #[test]
    fn entries_sorted_newest_first() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                &entry_line("old", "a", 100, "/w/p"),
                &entry_line("new", "b", 300, "/w/p"),
                &entry_line("mid", "c", 200, "/w/p"),
            ],
        );
        let entries = read_history(&path);
        let ids: Vec<&str> = entries.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                "not json at all",
                &entry_line("ok", "fine", 100, "/w/p"),
                r#"{"sessionId": "missing-fields"}"#,
                "",
            ],
        );
        let entries = read_history(&path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "ok");
    }

    // ── Filtering ─────────────────────────────────────────────────────────────

    #[test]
    fn filter_by_directory_string_fallback_for_nonexistent_paths() {
        let entries = vec![
            HistoryEntry {
                session_id: "a".into(),
                display: "x".into(),
                timestamp: 2,
                project: "/no/such/dir".into(),
            },
            HistoryEntry {
                session_id: "b".into(),
                display: "y".into(),
                timestamp: 1,
                project: "/other/dir".into(),
            },
        ];
        let filtered = filter_by_directory(&entries, Path::new("/no/such/dir"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].session_id, "a");
    }

    #[test]
    fn filter_matches_via_canonicalization() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().canonicalize().unwrap();
        let entries = vec![HistoryEntry {
            session_id: "a".into(),
            display: "x".into(),
            timestamp: 1,
            project: real.display().to_string(),
        }];
        // Query through a dot component; canonicalization resolves it.
        let dotted = tmp.path().join(".");
        assert_eq!(filter_by_directory(&entries, &dotted).len(), 1);
    }

    #[test]
    fn filter_preserves_newest_first_order() {
        let entries = vec![
            HistoryEntry {
                session_id: "n".into(),
                display: String::new(),
                timestamp: 9,
                project: "/p".into(),
            },
            HistoryEntry {
                session_id: "o".into(),
                display: String::new(),
                timestamp: 1,
                project: "/p".into(),
            },
        ];
        let filtered = filter_by_directory(&entries, Path::new("/p"));
        assert_eq!(filtered[0].session_id, "n");
        assert_eq!(filtered[1].session_id, "o");
    }

    // ── Lookup and health ─────────────────────────────────────────────────────

    #[test]
    fn find_session_by_id_first_match() {
        let entries = vec![
            HistoryEntry {
                session_id: "s1".into(),
                display: "a".into(),
                timestamp: 2,
                project: "/p".into(),
            },
            HistoryEntry {
                session_id: "s1".into(),
                display: "b".into(),
                timestamp: 1,
                project: "/p".into(),
            },
        ];
        assert_eq!(find_session_by_id(&entries, "s1").unwrap().display, "a");
        assert!(find_session_by_id(&entries, "nope").is_none());
    }

    #[test]
    fn health_warns_when_majority_malformed() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                "garbage one",
                "garbage two",
                "garbage three",
                &entry_line("ok", "fine", 100, "/w/p"),
                &entry_line("ok2", "fine", 100, "/w/p"),
            ],
        );
        let warning = history_health(&path).expect("60% malformed should warn");
        assert!(warning.contains("60.0%"), "got: {warning}");
    }

    #[test]
    fn health_quiet_when_mostly_valid() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                &entry_line("a", "x", 1, "/p"),
                &entry_line("b", "y", 2, "/p"),
                "one bad line",
            ],
        );
        assert!(history_health(&path).is_none());
    }

    #[test]
    fn health_of_missing_or_empty_file_is_none() {
        assert!(history_health(Path::new("/nonexistent")).is_none());
        let tmp = TempDir::new().unwrap();
        let path = write_history(&tmp, &[]);
        assert!(history_health(&path).is_none());
    }

    // ── Append ────────────────────────────────────────────────────────────────

    #[test]
    fn append_then_read_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("history.jsonl");

        let before = Utc::now().timestamp_millis();
        append_history_entry(&path, "s-1", "hello", "/w/proj");
        let after = Utc::now().timestamp_millis();

        let entries = read_history(&path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "s-1");
        assert_eq!(entries[0].display, "hello");
        assert_eq!(entries[0].project, "/w/proj");
        assert!(entries[0].timestamp >= before && entries[0].timestamp <= after);
    }

    #[test]
    fn append_failure_is_swallowed() {
        // Appending under a path whose parent is a file cannot succeed.
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        append_history_entry(&blocker.join("history.jsonl"), "s", "d", "/p");
    }

    // ── Resolver ──────────────────────────────────────────────────────────────

    #[test]
    fn resolver_latest_takes_first_for_directory() {
        let tmp = TempDir::new().unwrap();
        let path = write_history(
            &tmp,
            &[
                &entry_line("s2", "x", 1000, "/w/other"),
                &entry_line("s1", "hello", 500, "/w/proj"),
            ],
        );
        let resolver = SessionResolver::new(path);
        assert_eq!(
            resolver.latest_session(Path::new("/w/other")).as_deref(),
            Some("s2")
        );
        assert_eq!(
            resolver.latest_session(Path::new("/w/proj")).as_deref(),
            Some("s1")
        );
        assert!(resolver.latest_session(Path::new("/w/empty")).is_none());
    }

    #[test]
    fn resolver_list_sessions_respects_limit() {
        let tmp = TempDir::new().unwrap();
        let lines: Vec<String> = (0..5)
            .map(|i| entry_line(&format!("s{i}"), "d", i, "/w/p"))
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let path = write_history(&tmp, &refs);
        let resolver = SessionResolver::new(path);
        let listed = resolver.list_sessions(Path::new("/w/p"), 3);
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].session_id, "s4");
    }

    // ── Transcripts ───────────────────────────────────────────────────────────

    fn write_transcript(projects: &Path, project: &str, sid: &str, lines: &[Value]) {
        let dir = projects.join(project.replace('/', "-"));
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join(format!("{sid}.jsonl"))).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn transcript_reads_user_and_assistant_only() {
        let tmp = TempDir::new().unwrap();
        write_transcript(
            tmp.path(),
            "/w/proj",
            "sid",
            &[
                json!({"type": "user", "message": {"content": "hello"}}),
                json!({"type": "summary", "summary": "ignored"}),
                json!({"type": "assistant", "message": {"content": [
                    {"type": "text", "text": "hi there"}
                ]}}),
            ],
        );
        let msgs = read_session_transcript(tmp.path(), "sid", "/w/proj", 3);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].text, "hello");
        assert_eq!(msgs[1].role, "assistant");
        assert_eq!(msgs[1].text, "hi there");
    }

    #[test]
    fn transcript_skips_empty_and_system_injected() {
        let tmp = TempDir::new().unwrap();
        write_transcript(
            tmp.path(),
            "/w/proj",
            "sid",
            &[
                json!({"type": "user", "message": {"content": "<system-reminder>ignored"}}),
                json!({"type": "user", "message": {"content": "  "}}),
                json!({"type": "user", "message": {"content": "kept"}}),
            ],
        );
        let msgs = read_session_transcript(tmp.path(), "sid", "/w/proj", 3);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "kept");
    }

    #[test]
    fn transcript_returns_tail_of_two_times_limit() {
        let tmp = TempDir::new().unwrap();
        let lines: Vec<Value> = (0..10)
            .map(|i| json!({"type": "user", "message": {"content": format!("m{i}")}}))
            .collect();
        write_transcript(tmp.path(), "/w/proj", "sid", &lines);
        let msgs = read_session_transcript(tmp.path(), "sid", "/w/proj", 2);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].text, "m6");
        assert_eq!(msgs[3].text, "m9");
    }

    #[test]
    fn transcript_missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_session_transcript(tmp.path(), "nope", "/w/p", 3).is_empty());
    }
}

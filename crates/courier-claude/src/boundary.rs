// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-execution tool authorization.
//!
//! Every tool call is checked before the backend executes it.  File tools
//! must target a path inside an approved root (or the backend's own state
//! directories under `~/.claude/`).  Bash commands are tokenized, split
//! into subcommands, and any filesystem-modifying subcommand has its path
//! arguments validated against the approved roots.  When a command cannot
//! be parsed statically the call is allowed — the OS sandbox still applies.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Decision returned to the backend's permission hook.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// File-manipulation tools whose `file_path`/`path` argument is validated.
const FILE_TOOLS: &[&str] = &["Read", "Write", "Edit", "create_file", "edit_file", "read_file"];

/// Shell tools whose `command` argument is chain-parsed.
const BASH_TOOLS: &[&str] = &["Bash", "bash", "shell"];

/// Commands that are read-only or take no filesystem paths.
const READ_ONLY_COMMANDS: &[&str] = &[
    "cat", "ls", "head", "tail", "less", "more", "which", "whoami", "pwd", "echo", "printf",
    "env", "printenv", "date", "wc", "sort", "uniq", "diff", "file", "stat", "du", "df", "tree",
    "realpath", "dirname", "basename",
];

/// Commands that modify the filesystem or change context.
const FS_MODIFYING_COMMANDS: &[&str] = &[
    "mkdir", "touch", "cp", "mv", "rm", "rmdir", "ln", "install", "tee", "cd",
];

/// Actions that turn `find` into a filesystem-modifying command.
const FIND_MUTATING_ACTIONS: &[&str] = &["-delete", "-exec", "-execdir", "-ok", "-okdir"];

/// Bash command separators that delimit subcommands.
const COMMAND_SEPARATORS: &[&str] = &["&&", "||", ";", "|", "&"];

/// Host-controlled subpaths of `~/.claude/` that tools may always touch.
const CLAUDE_INTERNAL_SUBDIRS: &[&str] = &["plans", "todos", "settings.json"];

/// Authorize one tool invocation.
pub fn check_tool_use(
    tool_name: &str,
    tool_input: &Value,
    approved_roots: &[PathBuf],
    working_directory: &Path,
) -> PermissionDecision {
    if FILE_TOOLS.contains(&tool_name) {
        let file_path = tool_input
            .get("file_path")
            .or_else(|| tool_input.get("path"))
            .and_then(Value::as_str);
        if let Some(file_path) = file_path {
            if is_claude_internal_path(file_path) {
                return PermissionDecision::Allow;
            }
            let resolved = resolve_path(working_directory, file_path);
            if !within_any(&resolved, approved_roots) {
                warn!(tool_name, file_path, "denied file operation outside approved roots");
                return PermissionDecision::Deny {
                    message: format!(
                        "File path '{file_path}' is outside all approved directories"
                    ),
                };
            }
        }
    }

    if BASH_TOOLS.contains(&tool_name) {
        if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
            if let Err(message) =
                check_bash_boundary(command, working_directory, approved_roots)
            {
                warn!(tool_name, command, %message, "denied bash command");
                return PermissionDecision::Deny { message };
            }
        }
    }

    PermissionDecision::Allow
}

/// Check that a bash command's filesystem-modifying subcommands only
/// target paths within the approved roots.
pub fn check_bash_boundary(
    command: &str,
    working_directory: &Path,
    approved_roots: &[PathBuf],
) -> Result<(), String> {
    // Unparseable commands (unbalanced quotes, etc.) fall through to the
    // OS sandbox.
    let Some(tokens) = shlex::split(command) else {
        return Ok(());
    };
    if tokens.is_empty() {
        return Ok(());
    }

    for chain in split_subcommands(&tokens) {
        let Some(first) = chain.first() else { continue };
        let base = Path::new(first)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| first.clone());

        if READ_ONLY_COMMANDS.contains(&base.as_str()) {
            continue;
        }

        let needs_check = if base == "find" {
            chain[1..]
                .iter()
                .any(|t| FIND_MUTATING_ACTIONS.contains(&t.as_str()))
        } else {
            FS_MODIFYING_COMMANDS.contains(&base.as_str())
        };
        if !needs_check {
            continue;
        }

        for token in &chain[1..] {
            if token.starts_with('-') {
                continue;
            }
            let candidate = if token.starts_with('/') {
                PathBuf::from(token)
            } else {
                working_directory.join(token)
            };
            // Canonicalization failure (e.g. the target does not exist
            // yet) skips the token; the OS sandbox remains in effect.
            let Ok(resolved) = candidate.canonicalize() else {
                continue;
            };
            if !within_any(&resolved, approved_roots) {
                return Err(format!(
                    "Directory boundary violation: '{base}' targets '{token}' \
                     which is outside all approved directories"
                ));
            }
        }
    }

    Ok(())
}

/// Split a token list into subcommands on shell separators.
fn split_subcommands(tokens: &[String]) -> Vec<Vec<String>> {
    let mut chains = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        if COMMAND_SEPARATORS.contains(&token.as_str()) {
            if !current.is_empty() {
                chains.push(std::mem::take(&mut current));
            }
        } else {
            current.push(token.clone());
        }
    }
    if !current.is_empty() {
        chains.push(current);
    }
    chains
}

/// True when `file_path` targets one of the backend's own state
/// directories under `~/.claude/`.  These are outside the approved roots
/// but controlled entirely by the backend itself.
fn is_claude_internal_path(file_path: &str) -> bool {
    let Some(home) = dirs::home_dir() else {
        return false;
    };
    let claude_dir = home.join(".claude");
    let resolved = resolve_path(&home, file_path);
    let Ok(rel) = resolved.strip_prefix(&claude_dir) else {
        return false;
    };
    match rel.components().next() {
        Some(Component::Normal(top)) => CLAUDE_INTERNAL_SUBDIRS
            .iter()
            .any(|s| top.to_string_lossy() == *s),
        _ => false,
    }
}

/// Resolve a path against a base directory: canonicalize when possible,
/// otherwise normalize lexically so traversal through `..` is still
/// caught for paths that do not exist yet.
fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    };
    joined
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn within_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| {
        let root = root.canonicalize().unwrap_or_else(|_| root.clone());
        path.starts_with(&root)
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn roots(tmp: &TempDir) -> Vec<PathBuf> {
        vec![tmp.path().to_path_buf()]
    }

    // ── Bash boundary ─────────────────────────────────────────────────────────

    #[test]
    fn read_only_commands_always_allowed() {
        let tmp = TempDir::new().unwrap();
        for cmd in ["cat /etc/passwd", "ls /", "head -n 5 /etc/hosts", "pwd"] {
            assert!(
                check_bash_boundary(cmd, tmp.path(), &roots(&tmp)).is_ok(),
                "{cmd} should be allowed"
            );
        }
    }

    #[test]
    fn cd_outside_root_denied_with_command_and_token() {
        let tmp = TempDir::new().unwrap();
        let err = check_bash_boundary("cd /tmp && rm -rf /tmp/foo", tmp.path(), &roots(&tmp))
            .unwrap_err();
        assert!(err.contains("'cd'"), "got: {err}");
        assert!(err.contains("/tmp"), "got: {err}");
    }

    #[test]
    fn rm_inside_root_allowed() {
        let tmp = TempDir::new().unwrap();
        let victim = tmp.path().join("junk.txt");
        std::fs::write(&victim, "x").unwrap();
        let cmd = format!("rm {}", victim.display());
        assert!(check_bash_boundary(&cmd, tmp.path(), &roots(&tmp)).is_ok());
    }

    #[test]
    fn relative_traversal_is_resolved_against_cwd() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        // ../../tmp escapes the root via the parent chain; /tmp exists so
        // canonicalization succeeds and the escape is caught.
        let depth = sub.components().count();
        let escape = format!("cd {}tmp", "../".repeat(depth));
        let result = check_bash_boundary(&escape, &sub, &roots(&tmp));
        assert!(result.is_err(), "traversal outside root must be denied");
    }

    #[test]
    fn unbalanced_quotes_fall_through() {
        let tmp = TempDir::new().unwrap();
        assert!(check_bash_boundary("rm \"/etc/passwd", tmp.path(), &roots(&tmp)).is_ok());
    }

    #[test]
    fn plain_find_allowed_but_mutating_find_checked() {
        let tmp = TempDir::new().unwrap();
        assert!(check_bash_boundary("find /etc -name '*.conf'", tmp.path(), &roots(&tmp)).is_ok());

        let err = check_bash_boundary("find /etc -name '*.conf' -delete", tmp.path(), &roots(&tmp))
            .unwrap_err();
        assert!(err.contains("'find'"), "got: {err}");
        assert!(err.contains("/etc"), "got: {err}");
    }

    #[test]
    fn find_exec_outside_root_denied() {
        let tmp = TempDir::new().unwrap();
        let result =
            check_bash_boundary("find /tmp -exec rm {} ;", tmp.path(), &roots(&tmp));
        assert!(result.is_err());
    }

    #[test]
    fn unknown_commands_allowed() {
        let tmp = TempDir::new().unwrap();
        assert!(check_bash_boundary("cargo build --release", tmp.path(), &roots(&tmp)).is_ok());
        assert!(check_bash_boundary("git push origin main", tmp.path(), &roots(&tmp)).is_ok());
    }

    #[test]
    fn each_subcommand_checked_independently() {
        let tmp = TempDir::new().unwrap();
        // First subcommand fine, second escapes.
        let inside = tmp.path().join("f");
        std::fs::write(&inside, "x").unwrap();
        let cmd = format!("touch {} ; mv {} /tmp", inside.display(), inside.display());
        let err = check_bash_boundary(&cmd, tmp.path(), &roots(&tmp)).unwrap_err();
        assert!(err.contains("'mv'"), "got: {err}");
    }

    #[test]
    fn nonexistent_target_token_is_skipped() {
        let tmp = TempDir::new().unwrap();
        // The target does not exist, so canonicalization fails and the
        // token is skipped; the sandbox catches it at execution time.
        assert!(check_bash_boundary(
            "mkdir /nonexistent-xyz/deep/dir",
            tmp.path(),
            &roots(&tmp)
        )
        .is_ok());
    }

    #[test]
    fn empty_command_allowed() {
        let tmp = TempDir::new().unwrap();
        assert!(check_bash_boundary("", tmp.path(), &roots(&tmp)).is_ok());
    }

    // ── File tools ────────────────────────────────────────────────────────────

    #[test]
    fn file_tool_inside_root_allowed() {
        let tmp = TempDir::new().unwrap();
        let decision = check_tool_use(
            "Write",
            &json!({"file_path": tmp.path().join("new.rs").display().to_string()}),
            &roots(&tmp),
            tmp.path(),
        );
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[test]
    fn file_tool_outside_root_denied() {
        let tmp = TempDir::new().unwrap();
        let decision = check_tool_use(
            "Edit",
            &json!({"file_path": "/etc/passwd"}),
            &roots(&tmp),
            tmp.path(),
        );
        match decision {
            PermissionDecision::Deny { message } => {
                assert!(message.contains("/etc/passwd"));
            }
            PermissionDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn file_tool_relative_traversal_denied() {
        let tmp = TempDir::new().unwrap();
        let decision = check_tool_use(
            "Write",
            &json!({"file_path": "../../../../etc/hostile"}),
            &roots(&tmp),
            tmp.path(),
        );
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }

    #[test]
    fn claude_internal_paths_allowed() {
        let tmp = TempDir::new().unwrap();
        let home = dirs::home_dir().unwrap();
        let plan = home.join(".claude/plans/next.md");
        let decision = check_tool_use(
            "Write",
            &json!({"file_path": plan.display().to_string()}),
            &roots(&tmp),
            tmp.path(),
        );
        assert_eq!(decision, PermissionDecision::Allow);

        // Arbitrary files directly under ~/.claude/ are not internal.
        let stray = home.join(".claude/secrets.txt");
        let decision = check_tool_use(
            "Write",
            &json!({"file_path": stray.display().to_string()}),
            &roots(&tmp),
            tmp.path(),
        );
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }

    #[test]
    fn non_file_non_bash_tools_allowed() {
        let tmp = TempDir::new().unwrap();
        let decision = check_tool_use(
            "WebFetch",
            &json!({"url": "https://example.com"}),
            &roots(&tmp),
            tmp.path(),
        );
        assert_eq!(decision, PermissionDecision::Allow);
    }

    #[test]
    fn bash_tool_routes_through_boundary() {
        let tmp = TempDir::new().unwrap();
        let decision = check_tool_use(
            "Bash",
            &json!({"command": "cd /tmp"}),
            &roots(&tmp),
            tmp.path(),
        );
        assert!(matches!(decision, PermissionDecision::Deny { .. }));
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    #[test]
    fn split_subcommands_handles_all_separators() {
        let tokens: Vec<String> = ["a", "&&", "b", "||", "c", ";", "d", "|", "e", "&", "f"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let chains = split_subcommands(&tokens);
        assert_eq!(chains.len(), 6);
        assert_eq!(chains[0], vec!["a"]);
        assert_eq!(chains[5], vec!["f"]);
    }

    #[test]
    fn normalize_lexically_collapses_parents() {
        let p = normalize_lexically(Path::new("/w/proj/sub/../../other"));
        assert_eq!(p, PathBuf::from("/w/other"));
    }
}

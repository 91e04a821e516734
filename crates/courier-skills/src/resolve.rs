// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;

use regex::Regex;

fn indexed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$ARGUMENTS\[(\d+)\]").expect("static regex"))
}

fn positional_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(\d+)").expect("static regex"))
}

/// Substitute placeholders in a skill body.
///
/// Replacement order matters: indexed `$ARGUMENTS[N]` first (so the bare
/// `$ARGUMENTS` replacement cannot eat its prefix), then positional `$N`,
/// then the full `$ARGUMENTS` string, then `${CLAUDE_SESSION_ID}`.
/// Out-of-range positions substitute the empty string.
pub fn resolve_skill_prompt(body: &str, arguments: &str, session_id: &str) -> String {
    let args: Vec<&str> = arguments.split_whitespace().collect();

    let nth = |caps: &regex::Captures| -> String {
        caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|i| args.get(i).copied())
            .unwrap_or("")
            .to_string()
    };

    let result = indexed_re().replace_all(body, |caps: &regex::Captures| nth(caps));
    let result = positional_re().replace_all(&result, |caps: &regex::Captures| nth(caps));
    let result = result.replace("$ARGUMENTS", arguments);
    result.replace("${CLAUDE_SESSION_ID}", session_id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Telegram HTML formatting.
//!
//! Telegram's HTML mode needs only three characters escaped, which makes
//! it far more robust than Markdown for rendering model output full of
//! underscores and asterisks.  The converter targets the supported
//! subset: `<b> <i> <code> <pre> <a> <s>`.

use std::sync::OnceLock;

use regex::Regex;

/// Escape the three HTML-special characters for Telegram.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Convert common markdown patterns to Telegram's HTML subset.
///
/// Code spans are extracted first and restored verbatim at the end so
/// formatting rules never fire inside them.
pub fn markdown_to_telegram_html(text: &str) -> String {
    static FENCED: OnceLock<Regex> = OnceLock::new();
    static INLINE: OnceLock<Regex> = OnceLock::new();
    static BOLD_STARS: OnceLock<Regex> = OnceLock::new();
    static BOLD_UNDER: OnceLock<Regex> = OnceLock::new();
    static ITALIC_STAR: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static STRIKE: OnceLock<Regex> = OnceLock::new();

    let mut placeholders: Vec<(String, String)> = Vec::new();
    let mut out = text.to_string();

    // 1. Fenced code blocks → placeholders.
    let fenced = re(&FENCED, r"(?s)```(\w+)?\n(.*?)```");
    out = fenced
        .replace_all(&out, |caps: &regex::Captures| {
            let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let code = escape_html(&caps[2]);
            let html = if lang.is_empty() {
                format!("<pre><code>{code}</code></pre>")
            } else {
                format!(
                    "<pre><code class=\"language-{}\">{code}</code></pre>",
                    escape_html(lang)
                )
            };
            let key = format!("\u{0}PH{}\u{0}", placeholders.len());
            placeholders.push((key.clone(), html));
            key
        })
        .into_owned();

    // 2. Inline code → placeholders.
    let inline = re(&INLINE, r"`([^`\n]+)`");
    out = inline
        .replace_all(&out, |caps: &regex::Captures| {
            let html = format!("<code>{}</code>", escape_html(&caps[1]));
            let key = format!("\u{0}PH{}\u{0}", placeholders.len());
            placeholders.push((key.clone(), html));
            key
        })
        .into_owned();

    // 3. Escape everything that is left.
    out = escape_html(&out);

    // 4-8. Formatting patterns on the escaped text.
    out = re(&BOLD_STARS, r"\*\*(.+?)\*\*")
        .replace_all(&out, "<b>$1</b>")
        .into_owned();
    out = re(&BOLD_UNDER, r"__(.+?)__")
        .replace_all(&out, "<b>$1</b>")
        .into_owned();
    out = re(&ITALIC_STAR, r"\*(\S[^*]*\S|\S)\*")
        .replace_all(&out, "<i>$1</i>")
        .into_owned();
    out = re(&LINK, r"\[([^\]]+)\]\(([^)]+)\)")
        .replace_all(&out, "<a href=\"$2\">$1</a>")
        .into_owned();
    out = re(&HEADER, r"(?m)^#{1,6}\s+(.+)$")
        .replace_all(&out, "<b>$1</b>")
        .into_owned();
    out = re(&STRIKE, r"~~(.+?)~~")
        .replace_all(&out, "<s>$1</s>")
        .into_owned();

    // 9. Restore code placeholders.
    for (key, html) in placeholders {
        out = out.replace(&key, &html);
    }
    out
}

/// Format a millisecond timestamp as a relative time like "2 hours ago".
pub fn relative_time(timestamp_ms: i64) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let seconds = ((now - timestamp_ms) / 1000).max(0);

    if seconds < 60 {
        return "just now".into();
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{minutes} min ago");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours} {} ago", if hours == 1 { "hour" } else { "hours" });
    }
    let days = hours / 24;
    if days < 7 {
        return format!("{days} {} ago", if days == 1 { "day" } else { "days" });
    }
    let weeks = days / 7;
    if days < 30 {
        return format!("{weeks} {} ago", if weeks == 1 { "week" } else { "weeks" });
    }
    let months = days / 30;
    format!("{months} {} ago", if months == 1 { "month" } else { "months" })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

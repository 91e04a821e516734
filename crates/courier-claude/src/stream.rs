// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Normalizes the backend's heterogeneous event stream into a fixed
//! vocabulary.
//!
//! The backend emits two shapes: complete messages (assistant, result,
//! user echo) and partial deltas (raw `stream_event` records wrapping
//! `content_block_start` / `content_block_delta`).  Both are folded into
//! [`StreamEvent`]; malformed input becomes [`StreamEvent::Unknown`] and
//! never an error.

use serde_json::{Map, Value};
use tracing::debug;

/// One normalized element of the backend's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        name: String,
        input: Map<String, Value>,
    },
    ToolResult {
        content: String,
    },
    Result {
        content: String,
        session_id: Option<String>,
        cost: f64,
    },
    User,
    Unknown,
}

/// A normalized event plus whether it came from a partial delta.
///
/// Partial tool_use events are surfaced for UX but must not be counted
/// as turns; only complete messages drive the turn counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub event: StreamEvent,
    pub partial: bool,
}

impl Extracted {
    fn complete(event: StreamEvent) -> Self {
        Self {
            event,
            partial: false,
        }
    }

    fn partial(event: StreamEvent) -> Self {
        Self {
            event,
            partial: true,
        }
    }
}

/// Extracts structured events from raw backend messages.
#[derive(Debug, Default)]
pub struct StreamHandler;

impl StreamHandler {
    pub fn new() -> Self {
        Self
    }

    /// Convert one backend JSON value into one event.  Never fails.
    pub fn extract(&self, message: &Value) -> Extracted {
        match message.get("type").and_then(Value::as_str) {
            Some("result") => Extracted::complete(handle_result(message)),
            Some("assistant") => Extracted::complete(handle_assistant(message)),
            Some("stream_event") => Extracted::partial(handle_partial(message)),
            Some("user") => Extracted::complete(handle_user(message)),
            other => {
                debug!(message_type = ?other, "unknown backend message type");
                Extracted::complete(StreamEvent::Unknown)
            }
        }
    }
}

fn handle_result(message: &Value) -> StreamEvent {
    StreamEvent::Result {
        content: message
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        session_id: message
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        cost: message
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
    }
}

fn content_blocks(message: &Value) -> &[Value] {
    message
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn handle_assistant(message: &Value) -> StreamEvent {
    let blocks = content_blocks(message);
    if blocks.is_empty() {
        return StreamEvent::Text {
            content: String::new(),
        };
    }

    // A single special block yields a dedicated event.
    if blocks.len() == 1 {
        let block = &blocks[0];
        match block.get("type").and_then(Value::as_str) {
            Some("thinking") => {
                return StreamEvent::Thinking {
                    content: block
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                };
            }
            Some("tool_use") => {
                return StreamEvent::ToolUse {
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: block
                        .get("input")
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                };
            }
            _ => {}
        }
    }

    // Default: concatenate all text blocks in order.
    let content: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    StreamEvent::Text { content }
}

fn handle_user(message: &Value) -> StreamEvent {
    // Tool results echo back as user messages carrying tool_result blocks.
    let texts: Vec<&str> = content_blocks(message)
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .filter_map(|b| b.get("content"))
        .flat_map(tool_result_texts)
        .collect();
    if texts.is_empty() {
        StreamEvent::User
    } else {
        StreamEvent::ToolResult {
            content: texts.join("\n"),
        }
    }
}

/// A tool_result's `content` is either a plain string or a list of
/// text blocks.
fn tool_result_texts(content: &Value) -> Vec<&str> {
    match content {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    }
}

fn handle_partial(message: &Value) -> StreamEvent {
    let event = match message.get("event") {
        Some(e) => e,
        None => return StreamEvent::Unknown,
    };

    match event.get("type").and_then(Value::as_str) {
        Some("content_block_start") => {
            let block = event.get("content_block").cloned().unwrap_or(Value::Null);
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => StreamEvent::ToolUse {
                    name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    // Input streams in later via input_json_delta; the
                    // complete message carries the full dictionary.
                    input: Map::new(),
                },
                Some("thinking") => StreamEvent::Thinking {
                    content: String::new(),
                },
                _ => StreamEvent::Unknown,
            }
        }
        Some("content_block_delta") => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => StreamEvent::Text {
                    content: delta
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                Some("thinking_delta") => StreamEvent::Thinking {
                    content: delta
                        .get("thinking")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                },
                // input_json_delta streams partial tool input; the full
                // input arrives with the complete message.
                _ => StreamEvent::Unknown,
            }
        }
        // message_start, message_delta, content_block_stop, …
        _ => StreamEvent::Unknown,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

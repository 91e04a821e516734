// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Telegram Bot API contract: inbound wire types, the outbound [`ChatApi`]
//! seam, and a thin long-polling adapter over reqwest.
//!
//! Delivery semantics (HTML subset, 4096-char message cap, edit rate
//! limits) are the platform's; callers handle them by falling back to
//! plain text and throttling edits.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

// ── Inbound wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
    /// Photo renditions ordered smallest to largest.
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

// ── Outbound surface ──────────────────────────────────────────────────────────

/// Handle to a sent message, sufficient to edit it later.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// One inline keyboard button.
#[derive(Debug, Clone)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram error: {0}")]
    Telegram(String),
}

/// Outbound platform operations.  The orchestrator and progress manager
/// talk to Telegram only through this trait, which keeps them testable
/// against an in-memory fake.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str, html: bool)
        -> Result<MessageRef, ApiError>;

    async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        html: bool,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageRef, ApiError>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), ApiError>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), ApiError>;

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ApiError>;

    /// Download a file's bytes by its Telegram file id.
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError>;
}

// ── Bot API adapter ───────────────────────────────────────────────────────────

/// Long-polling Bot API client.
pub struct TelegramApi {
    client: reqwest::Client,
    base: String,
    file_base: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{token}"),
            file_base: format!("https://api.telegram.org/file/bot{token}"),
        }
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value, ApiError> {
        let resp: Value = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = resp
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(ApiError::Telegram(description));
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fetch the next batch of updates, long-polling up to `timeout_secs`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, ApiError> {
        let result = self
            .call(
                "getUpdates",
                json!({"offset": offset, "timeout": timeout_secs}),
            )
            .await?;
        let updates: Vec<Update> = serde_json::from_value(result).unwrap_or_else(|e| {
            warn!(error = %e, "failed to deserialize updates batch");
            Vec::new()
        });
        Ok(updates)
    }

    fn keyboard_json(keyboard: &[Vec<InlineButton>]) -> Value {
        let rows: Vec<Vec<Value>> = keyboard
            .iter()
            .map(|row| {
                row.iter()
                    .map(|b| json!({"text": b.text, "callback_data": b.callback_data}))
                    .collect()
            })
            .collect();
        json!({"inline_keyboard": rows})
    }

    fn message_ref(result: &Value) -> Result<MessageRef, ApiError> {
        let chat_id = result
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64);
        let message_id = result.get("message_id").and_then(Value::as_i64);
        match (chat_id, message_id) {
            (Some(chat_id), Some(message_id)) => Ok(MessageRef {
                chat_id,
                message_id,
            }),
            _ => Err(ApiError::Telegram("sendMessage returned no message".into())),
        }
    }
}

#[async_trait]
impl ChatApi for TelegramApi {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        html: bool,
    ) -> Result<MessageRef, ApiError> {
        let mut body = json!({"chat_id": chat_id, "text": text});
        if html {
            body["parse_mode"] = json!("HTML");
        }
        let result = self.call("sendMessage", body).await?;
        Self::message_ref(&result)
    }

    async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        html: bool,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageRef, ApiError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "reply_markup": Self::keyboard_json(keyboard),
        });
        if html {
            body["parse_mode"] = json!("HTML");
        }
        let result = self.call("sendMessage", body).await?;
        Self::message_ref(&result)
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), ApiError> {
        self.call(
            "editMessageText",
            json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "text": text,
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), ApiError> {
        self.call(
            "sendChatAction",
            json!({"chat_id": chat_id, "action": action}),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), ApiError> {
        self.call(
            "answerCallbackQuery",
            json!({"callback_query_id": callback_id}),
        )
        .await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let info = self.call("getFile", json!({"file_id": file_id})).await?;
        let path = info
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Telegram("getFile returned no file_path".into()))?;
        debug!(file_id, path, "downloading file");
        let bytes = self
            .client
            .get(format!("{}/{path}", self.file_base))
            .send()
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;

/// A typed payload element in the backend's message schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: BlockSource,
    },
    Document {
        source: BlockSource,
        title: String,
    },
}

/// Source payload for image and document blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockSource {
    Base64 { media_type: String, data: String },
    Text { media_type: String, data: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            source: BlockSource::Base64 {
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn pdf_base64(title: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Document {
            source: BlockSource::Base64 {
                media_type: "application/pdf".into(),
                data: data.into(),
            },
            title: title.into(),
        }
    }

    pub fn inline_text(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Document {
            source: BlockSource::Text {
                media_type: "text/plain".into(),
                data: text.into(),
            },
            title: title.into(),
        }
    }
}

/// One processed inbound attachment, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub block: ContentBlock,
    pub filename: String,
    pub size: usize,
    pub media_type: String,
}

/// An immutable user submission: optional text plus ordered attachments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Query {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    /// Project to backend content blocks: text first (when present), then
    /// each attachment's block in order.
    pub fn to_content_blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        if let Some(text) = &self.text {
            if !text.is_empty() {
                blocks.push(ContentBlock::text(text.clone()));
            }
        }
        for att in &self.attachments {
            blocks.push(att.block.clone());
        }
        blocks
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

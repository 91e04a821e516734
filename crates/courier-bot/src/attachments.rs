// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Converts inbound Telegram media into backend content blocks, and
//! coalesces album items that arrive as separate updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use courier_claude::types::{Attachment, ContentBlock};

use crate::api::{ChatApi, Document, PhotoSize, Update};

/// Image magic-byte signatures checked before trusting declared MIME.
const IMAGE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"RIFF", "image/webp"),
];

/// Extensions accepted as inline text documents.
const TEXT_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "cpp", "c", "h", "hpp", "cs", "go", "rs", "rb",
    "php", "swift", "kt", "scala", "r", "jl", "lua", "pl", "sh", "bash", "zsh", "fish", "ps1",
    "bat", "cmd", "md", "txt", "rst", "adoc", "json", "yml", "yaml", "toml", "xml", "ini",
    "cfg", "conf", "env", "html", "css", "scss", "sass", "less", "vue", "svelte", "csv", "tsv",
    "log", "sql", "dockerfile", "makefile", "cmake", "lock", "gitignore", "gitattributes",
    "editorconfig",
];

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    /// Binary attachment of a type the backend cannot consume.
    #[error("Can't process .{extension} files. Try sending as PDF or pasting the content as text.")]
    Unsupported {
        filename: String,
        mime_type: Option<String>,
        extension: String,
    },
    #[error("failed to download attachment: {0}")]
    Download(String),
}

fn detect_image_media_type(data: &[u8]) -> Option<&'static str> {
    IMAGE_SIGNATURES
        .iter()
        .find(|(sig, _)| data.starts_with(sig))
        .map(|(_, mime)| *mime)
}

fn file_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

fn unsupported(filename: &str, mime_type: Option<&str>) -> AttachmentError {
    let extension = match filename.rsplit_once('.') {
        Some((_, ext)) => ext.to_string(),
        None => "unknown".to_string(),
    };
    AttachmentError::Unsupported {
        filename: filename.to_string(),
        mime_type: mime_type.map(str::to_string),
        extension,
    }
}

/// Converts photos and documents into [`Attachment`] values.
pub struct AttachmentProcessor {
    api: Arc<dyn ChatApi>,
}

impl AttachmentProcessor {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    /// Process a photo message: pick the largest rendition, sniff the
    /// media type, wrap as a base64 image block.
    pub async fn process_photo(&self, photos: &[PhotoSize]) -> Result<Attachment, AttachmentError> {
        let largest = photos
            .last()
            .ok_or_else(|| AttachmentError::Download("empty photo set".into()))?;
        let data = self
            .api
            .download_file(&largest.file_id)
            .await
            .map_err(|e| AttachmentError::Download(e.to_string()))?;

        let media_type = detect_image_media_type(&data).unwrap_or("image/jpeg");
        let filename = format!(
            "photo.{}",
            media_type.rsplit('/').next().unwrap_or("jpeg")
        );
        debug!(filename, media_type, size = data.len(), "processed photo");

        Ok(Attachment {
            block: ContentBlock::image_base64(media_type, BASE64.encode(&data)),
            filename,
            size: data.len(),
            media_type: media_type.to_string(),
        })
    }

    /// Process a document through the resolution chain: image by magic
    /// bytes, image by MIME, PDF, textual, last-resort UTF-8.
    pub async fn process_document(&self, doc: &Document) -> Result<Attachment, AttachmentError> {
        let filename = doc.file_name.clone().unwrap_or_else(|| "document".into());
        let mime_type = doc.mime_type.as_deref();

        let data = self
            .api
            .download_file(&doc.file_id)
            .await
            .map_err(|e| AttachmentError::Download(e.to_string()))?;

        self.classify_document(&filename, mime_type, data)
    }

    fn classify_document(
        &self,
        filename: &str,
        mime_type: Option<&str>,
        data: Vec<u8>,
    ) -> Result<Attachment, AttachmentError> {
        let size = data.len();

        // 1. Magic bytes say image (overrides MIME).
        if let Some(detected) = detect_image_media_type(&data) {
            debug!(filename, media_type = detected, size, "processed image document");
            return Ok(Attachment {
                block: ContentBlock::image_base64(detected, BASE64.encode(&data)),
                filename: filename.to_string(),
                size,
                media_type: detected.to_string(),
            });
        }

        // 2. Declared MIME says image.
        if let Some(mime) = mime_type.filter(|m| m.starts_with("image/")) {
            debug!(filename, media_type = mime, size, "processed image document by mime");
            return Ok(Attachment {
                block: ContentBlock::image_base64(mime, BASE64.encode(&data)),
                filename: filename.to_string(),
                size,
                media_type: mime.to_string(),
            });
        }

        // 3. PDF by signature or MIME.
        if mime_type == Some("application/pdf") || data.starts_with(b"%PDF-") {
            debug!(filename, size, "processed pdf document");
            return Ok(Attachment {
                block: ContentBlock::pdf_base64(filename, BASE64.encode(&data)),
                filename: filename.to_string(),
                size,
                media_type: "application/pdf".to_string(),
            });
        }

        // 4. Textual by MIME or extension allow-list.
        let ext = file_extension(filename);
        let is_text_mime = mime_type
            .is_some_and(|m| m.starts_with("text/") || m == "application/json");
        if is_text_mime || TEXT_EXTENSIONS.contains(&ext.as_str()) {
            let text = String::from_utf8(data).map_err(|_| unsupported(filename, mime_type))?;
            debug!(filename, ext, size, "processed text document");
            return Ok(Attachment {
                block: ContentBlock::inline_text(filename, text),
                filename: filename.to_string(),
                size,
                media_type: mime_type.unwrap_or("text/plain").to_string(),
            });
        }

        // 5. Last resort: a clean UTF-8 decode is accepted as text.
        match String::from_utf8(data) {
            Ok(text) => {
                debug!(filename, size, "processed unknown document as text");
                Ok(Attachment {
                    block: ContentBlock::inline_text(filename, text),
                    filename: filename.to_string(),
                    size,
                    media_type: "text/plain".to_string(),
                })
            }
            Err(_) => {
                warn!(filename, ?mime_type, "unsupported binary attachment");
                Err(unsupported(filename, mime_type))
            }
        }
    }
}

// ─── Album coalescing ────────────────────────────────────────────────────────

#[derive(Default)]
struct CollectorState {
    pending: HashMap<String, Vec<Update>>,
    timers: HashMap<String, JoinHandle<()>>,
    ready: HashMap<String, Vec<Update>>,
}

/// Buffers album items sharing a `media_group_id` behind a sliding-window
/// timer.  Singles pass straight through; grouped items become available
/// via [`pop_ready`](Self::pop_ready) once the window closes.
pub struct MediaGroupCollector {
    timeout: Duration,
    state: Arc<Mutex<CollectorState>>,
}

impl MediaGroupCollector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Arc::new(Mutex::new(CollectorState::default())),
        }
    }

    /// Add one update.  Returns the batch immediately for non-album
    /// messages; album members return `None` while buffering.
    pub async fn add(&self, update: Update) -> Option<Vec<Update>> {
        let group_id = update
            .message
            .as_ref()
            .and_then(|m| m.media_group_id.clone());
        let Some(group_id) = group_id else {
            return Some(vec![update]);
        };

        let mut state = self.state.lock().await;
        state.pending.entry(group_id.clone()).or_default().push(update);

        // Sliding window: each new item restarts the timer.
        if let Some(existing) = state.timers.remove(&group_id) {
            existing.abort();
        }
        let timer_state = self.state.clone();
        let timer_group = group_id.clone();
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = timer_state.lock().await;
            if let Some(items) = state.pending.remove(&timer_group) {
                debug!(group = %timer_group, count = items.len(), "album window closed");
                state.ready.insert(timer_group.clone(), items);
            }
            state.timers.remove(&timer_group);
        });
        state.timers.insert(group_id, handle);
        None
    }

    /// Pop a completed group if its window has closed.
    pub async fn pop_ready(&self, group_id: &str) -> Option<Vec<Update>> {
        self.state.lock().await.ready.remove(group_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, InlineButton, MessageRef};
    use async_trait::async_trait;

    /// ChatApi fake that serves one canned file body.
    struct FileServer(Vec<u8>);

    #[async_trait]
    impl ChatApi for FileServer {
        async fn send_message(&self, _: i64, _: &str, _: bool) -> Result<MessageRef, ApiError> {
            unimplemented!("not used in attachment tests")
        }
        async fn send_message_with_keyboard(
            &self,
            _: i64,
            _: &str,
            _: bool,
            _: &[Vec<InlineButton>],
        ) -> Result<MessageRef, ApiError> {
            unimplemented!("not used in attachment tests")
        }
        async fn edit_message(&self, _: &MessageRef, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn send_chat_action(&self, _: i64, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn answer_callback(&self, _: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn download_file(&self, _: &str) -> Result<Vec<u8>, ApiError> {
            Ok(self.0.clone())
        }
    }

    fn processor(bytes: &[u8]) -> AttachmentProcessor {
        AttachmentProcessor::new(Arc::new(FileServer(bytes.to_vec())))
    }

    fn doc(name: &str, mime: Option<&str>) -> Document {
        Document {
            file_id: "f1".into(),
            file_name: Some(name.into()),
            mime_type: mime.map(str::to_string),
            file_size: None,
        }
    }

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\nrest-of-image";

    // ── Photos ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn photo_detects_png_and_picks_largest() {
        let p = processor(PNG);
        let photos = vec![
            PhotoSize {
                file_id: "small".into(),
                width: 90,
                height: 60,
            },
            PhotoSize {
                file_id: "large".into(),
                width: 900,
                height: 600,
            },
        ];
        let att = p.process_photo(&photos).await.unwrap();
        assert_eq!(att.media_type, "image/png");
        assert_eq!(att.filename, "photo.png");
        assert_eq!(att.size, PNG.len());
        assert!(matches!(att.block, ContentBlock::Image { .. }));
    }

    #[tokio::test]
    async fn photo_defaults_to_jpeg_when_unrecognized() {
        let p = processor(b"mystery-bytes-not-an-image");
        let photos = vec![PhotoSize {
            file_id: "only".into(),
            width: 1,
            height: 1,
        }];
        let att = p.process_photo(&photos).await.unwrap();
        assert_eq!(att.media_type, "image/jpeg");
    }

    // ── Documents ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn magic_bytes_beat_declared_mime() {
        let p = processor(PNG);
        let att = p
            .process_document(&doc("weird.bin", Some("application/octet-stream")))
            .await
            .unwrap();
        assert_eq!(att.media_type, "image/png");
    }

    #[tokio::test]
    async fn declared_image_mime_used_without_signature() {
        let p = processor(b"not-really-image-bytes");
        let att = p
            .process_document(&doc("pic.heic", Some("image/heic")))
            .await
            .unwrap();
        assert_eq!(att.media_type, "image/heic");
    }

    #[tokio::test]
    async fn pdf_by_signature_gets_document_block_with_title() {
        let p = processor(b"%PDF-1.7 rest");
        let att = p.process_document(&doc("paper.pdf", None)).await.unwrap();
        assert_eq!(att.media_type, "application/pdf");
        match &att.block {
            ContentBlock::Document { title, .. } => assert_eq!(title, "paper.pdf"),
            other => panic!("expected document block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn code_extension_becomes_inline_text() {
        let p = processor(b"fn main() {}\n");
        let att = p.process_document(&doc("main.rs", None)).await.unwrap();
        match &att.block {
            ContentBlock::Document { source, title } => {
                assert_eq!(title, "main.rs");
                let text = match source {
                    courier_claude::types::BlockSource::Text { data, .. } => data,
                    other => panic!("expected text source, got {other:?}"),
                };
                assert!(text.contains("fn main"));
            }
            other => panic!("expected document block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_extension_utf8_falls_back_to_text() {
        let p = processor(b"plain utf8 content");
        let att = p.process_document(&doc("NOTES.custom", None)).await.unwrap();
        assert_eq!(att.media_type, "text/plain");
    }

    #[tokio::test]
    async fn binary_garbage_is_unsupported_and_names_extension() {
        let p = processor(&[0u8, 159, 146, 150, 255, 0, 1]);
        let err = p
            .process_document(&doc("firmware.bin", Some("application/octet-stream")))
            .await
            .err()
            .expect("must fail");
        let msg = err.to_string();
        assert!(msg.contains(".bin"), "got: {msg}");
        assert!(msg.contains("PDF"), "got: {msg}");
    }

    // ── Album coalescing ──────────────────────────────────────────────────────

    fn album_update(id: i64, group: Option<&str>) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": id,
            "message": {
                "message_id": id,
                "chat": {"id": 5},
                "media_group_id": group,
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn single_message_returns_immediately() {
        let collector = MediaGroupCollector::new(Duration::from_millis(50));
        let batch = collector.add(album_update(1, None)).await;
        assert_eq!(batch.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn album_items_coalesce_after_window() {
        let collector = MediaGroupCollector::new(Duration::from_millis(50));
        assert!(collector.add(album_update(1, Some("G1"))).await.is_none());
        assert!(collector.add(album_update(2, Some("G1"))).await.is_none());
        assert!(collector.add(album_update(3, Some("G1"))).await.is_none());

        // Window still open.
        assert!(collector.pop_ready("G1").await.is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let batch = collector.pop_ready("G1").await.expect("batch ready");
        assert_eq!(batch.len(), 3);
        // Popping twice yields nothing.
        assert!(collector.pop_ready("G1").await.is_none());
    }

    #[tokio::test]
    async fn sliding_window_resets_on_each_add() {
        let collector = MediaGroupCollector::new(Duration::from_millis(80));
        collector.add(album_update(1, Some("G1"))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second add restarts the 80ms window.
        collector.add(album_update(2, Some("G1"))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(collector.pop_ready("G1").await.is_none(), "window was reset");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(collector.pop_ready("G1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_groups_are_independent() {
        let collector = MediaGroupCollector::new(Duration::from_millis(40));
        collector.add(album_update(1, Some("G1"))).await;
        collector.add(album_update(2, Some("G2"))).await;
        collector.add(album_update(3, Some("G1"))).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.pop_ready("G1").await.unwrap().len(), 2);
        assert_eq!(collector.pop_ready("G2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn album_of_one_still_coalesces_via_timer() {
        let collector = MediaGroupCollector::new(Duration::from_millis(40));
        assert!(collector.add(album_update(1, Some("G9"))).await.is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(collector.pop_ready("G9").await.unwrap().len(), 1);
    }
}

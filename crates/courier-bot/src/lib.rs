// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Telegram-facing layer: wire types and transport, attachment
//! processing, the live progress message, and the orchestrator that ties
//! updates to the per-user session runtime.

pub mod api;
pub mod attachments;
pub mod html;
pub mod orchestrator;
pub mod progress;

pub use api::{ChatApi, InlineButton, MessageRef, TelegramApi, Update};
pub use attachments::{AttachmentError, AttachmentProcessor, MediaGroupCollector};
pub use orchestrator::Orchestrator;
pub use progress::ProgressManager;

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-user Claude Code session runtime.
//!
//! The backend connection for each user is owned by a single long-lived
//! task (the [`UserClient`] worker); everything else talks to it through
//! a mailbox.  The [`ClientManager`] owns the registry of those actors
//! and resolves which session each new connection should resume.

pub mod boundary;
pub mod client;
pub mod error;
pub mod history;
pub mod manager;
pub mod options;
pub mod stream;
pub mod transport;
pub mod types;

pub use client::{QueryEvent, QueryResult, UserClient};
pub use error::ClaudeError;
pub use history::{HistoryEntry, SessionResolver, TranscriptMessage};
pub use manager::ClientManager;
pub use options::{AgentOptions, OptionsBuilder};
pub use stream::{StreamEvent, StreamHandler};
pub use types::{Attachment, ContentBlock, Query};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors surfaced by the session runtime.
#[derive(Debug, Error)]
pub enum ClaudeError {
    /// The actor has no running worker; call start first.
    #[error("client is not running; call start() first")]
    NotRunning,

    /// Establishing the backend connection failed.
    #[error("failed to connect to backend: {0}")]
    BackendConnect(String),

    /// A received message could not be parsed.  Dropped by the worker;
    /// only visible in logs.
    #[error("failed to parse backend message: {0}")]
    BackendParse(String),

    /// A query failed mid-stream.  The submission's future carries this;
    /// the actor itself returns to the connected state.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The worker terminated while a submission was pending.
    #[error("worker terminated before the query completed")]
    WorkerGone,
}

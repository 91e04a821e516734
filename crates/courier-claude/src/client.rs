// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-user backend actor.
//!
//! A single long-lived task owns the full connection lifecycle: connect →
//! query → … → query → disconnect.  All operations on the connection
//! happen inside that task; other tasks interact only by enqueueing work
//! items on the mailbox and awaiting their reply, or by signalling an
//! interrupt, which the worker forwards at its next suspension point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::boundary::check_tool_use;
use crate::error::ClaudeError;
use crate::options::AgentOptions;
use crate::stream::{StreamEvent, StreamHandler};
use crate::transport::ClaudeProcess;
use crate::types::Query;

/// How long `stop()` waits for the worker before hard-cancelling it.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Events surfaced to the caller while a query streams.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEvent {
    Text {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolUse {
        name: String,
        input: Map<String, Value>,
        /// True for streamed block starts; these are shown but not
        /// counted as turns.
        partial: bool,
    },
    ToolResult {
        content: String,
    },
}

/// Result of one completed query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub response_text: String,
    pub session_id: Option<String>,
    pub cost: f64,
    pub num_turns: u32,
    pub duration_ms: u64,
}

/// Invoked exactly once when the worker exits, with (user_id, epoch).
pub type ExitHook = Arc<dyn Fn(i64, u64) + Send + Sync>;

struct WorkItem {
    query: Query,
    events: Option<mpsc::UnboundedSender<QueryEvent>>,
    reply: oneshot::Sender<Result<QueryResult, ClaudeError>>,
}

enum Mail {
    Work(Box<WorkItem>),
    Stop,
}

#[derive(Default)]
struct ClientState {
    connected: AtomicBool,
    querying: AtomicBool,
    session_id: StdMutex<Option<String>>,
    model: StdMutex<Option<String>>,
    betas: StdMutex<Vec<String>>,
}

/// Actor handle for one user's backend connection.
pub struct UserClient {
    pub user_id: i64,
    pub directory: PathBuf,
    /// Distinguishes this instance from any replacement for the same
    /// user, so a late exit notification cannot evict a newer client.
    epoch: u64,
    idle_timeout: Duration,
    state: Arc<ClientState>,
    mail_tx: StdMutex<Option<mpsc::UnboundedSender<Mail>>>,
    interrupt_tx: StdMutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_exit: ExitHook,
}

impl UserClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        directory: PathBuf,
        session_id: Option<String>,
        model: Option<String>,
        betas: Vec<String>,
        idle_timeout: Duration,
        epoch: u64,
        on_exit: ExitHook,
    ) -> Self {
        let state = ClientState::default();
        *lock(&state.session_id) = session_id;
        *lock(&state.model) = model;
        *lock(&state.betas) = betas;
        Self {
            user_id,
            directory,
            epoch,
            idle_timeout,
            state: Arc::new(state),
            mail_tx: StdMutex::new(None),
            interrupt_tx: StdMutex::new(None),
            worker: Mutex::new(None),
            on_exit,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_querying(&self) -> bool {
        self.state.querying.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.state.session_id).clone()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *lock(&self.state.session_id) = Some(session_id.to_string());
    }

    pub fn model(&self) -> Option<String> {
        lock(&self.state.model).clone()
    }

    pub fn betas(&self) -> Vec<String> {
        lock(&self.state.betas).clone()
    }

    pub fn set_model(&self, model: &str, betas: Option<Vec<String>>) {
        *lock(&self.state.model) = Some(model.to_string());
        if let Some(betas) = betas {
            *lock(&self.state.betas) = betas;
        }
    }

    /// Spawn the worker and connect.  Idempotent: a running client is
    /// stopped first.  A connect failure leaves the actor stopped and is
    /// returned to the caller.
    pub async fn start(&self, options: AgentOptions) -> Result<(), ClaudeError> {
        if self.is_connected() {
            self.stop().await;
        }

        let (mail_tx, mail_rx) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);
        let (connected_tx, connected_rx) = oneshot::channel();

        *lock(&self.mail_tx) = Some(mail_tx);
        *lock(&self.interrupt_tx) = Some(interrupt_tx);

        let handle = tokio::spawn(worker(
            options,
            self.state.clone(),
            mail_rx,
            interrupt_rx,
            connected_tx,
            self.idle_timeout,
            self.user_id,
            self.epoch,
            self.on_exit.clone(),
        ));
        *self.worker.lock().await = Some(handle);

        match connected_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.clear_handles().await;
                Err(e)
            }
            Err(_) => {
                self.clear_handles().await;
                Err(ClaudeError::BackendConnect("worker died during connect".into()))
            }
        }
    }

    /// Enqueue a query and await its result.  Streaming events are
    /// delivered through `events` in backend order.
    pub async fn submit(
        &self,
        query: Query,
        events: Option<mpsc::UnboundedSender<QueryEvent>>,
    ) -> Result<QueryResult, ClaudeError> {
        let tx = lock(&self.mail_tx).clone().ok_or(ClaudeError::NotRunning)?;
        if !self.is_connected() {
            return Err(ClaudeError::NotRunning);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Mail::Work(Box::new(WorkItem {
            query,
            events,
            reply: reply_tx,
        })))
        .map_err(|_| ClaudeError::NotRunning)?;

        reply_rx.await.map_err(|_| ClaudeError::WorkerGone)?
    }

    /// Interrupt the in-flight query, if any.  Safe from any task.
    pub async fn interrupt(&self) {
        if !self.is_querying() {
            return;
        }
        let tx = lock(&self.interrupt_tx).clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(());
            info!(user_id = self.user_id, "query interrupt requested");
        }
    }

    /// Enqueue the stop sentinel and await worker exit, hard-cancelling
    /// after [`STOP_TIMEOUT`].  Pending items ahead of the sentinel still
    /// run to completion.
    pub async fn stop(&self) {
        if let Some(tx) = lock(&self.mail_tx).take() {
            let _ = tx.send(Mail::Stop);
        }
        *lock(&self.interrupt_tx) = None;

        let handle = self.worker.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!(user_id = self.user_id, "worker did not stop in time; aborting");
                handle.abort();
            }
        }
    }

    async fn clear_handles(&self) {
        *lock(&self.mail_tx) = None;
        *lock(&self.interrupt_tx) = None;
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Locks a std mutex, recovering from poisoning (state values are plain
/// data; a panicked writer cannot leave them torn).
fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn worker(
    options: AgentOptions,
    state: Arc<ClientState>,
    mut mail_rx: mpsc::UnboundedReceiver<Mail>,
    mut interrupt_rx: mpsc::Receiver<()>,
    connected_tx: oneshot::Sender<Result<(), ClaudeError>>,
    idle_timeout: Duration,
    user_id: i64,
    epoch: u64,
    on_exit: ExitHook,
) {
    let mut transport = match ClaudeProcess::connect(&options).await {
        Ok(t) => t,
        Err(e) => {
            let _ = connected_tx.send(Err(e));
            on_exit(user_id, epoch);
            return;
        }
    };
    state.connected.store(true, Ordering::SeqCst);
    let _ = connected_tx.send(Ok(()));
    info!(user_id, directory = %options.cwd.display(), session_id = ?options.resume, "user client connected");

    loop {
        match tokio::time::timeout(idle_timeout, mail_rx.recv()).await {
            Err(_) => {
                info!(user_id, "user client idle timeout");
                break;
            }
            Ok(None) | Ok(Some(Mail::Stop)) => break,
            Ok(Some(Mail::Work(item))) => {
                process_item(&mut transport, &state, *item, &mut interrupt_rx, &options).await;
            }
        }
    }

    transport.disconnect().await;
    state.connected.store(false, Ordering::SeqCst);
    state.querying.store(false, Ordering::SeqCst);
    info!(user_id, "user client stopped");
    on_exit(user_id, epoch);
}

async fn process_item(
    transport: &mut ClaudeProcess,
    state: &ClientState,
    item: WorkItem,
    interrupt_rx: &mut mpsc::Receiver<()>,
    options: &AgentOptions,
) {
    state.querying.store(true, Ordering::SeqCst);
    // Drain any interrupt raised between queries; it applied to nothing.
    while interrupt_rx.try_recv().is_ok() {}

    let result = run_query(transport, &item.query, item.events.as_ref(), interrupt_rx, options).await;

    if let Ok(r) = &result {
        if let Some(sid) = &r.session_id {
            *lock(&state.session_id) = Some(sid.clone());
        }
    }
    let _ = item.reply.send(result);
    state.querying.store(false, Ordering::SeqCst);
}

async fn run_query(
    transport: &mut ClaudeProcess,
    query: &Query,
    events: Option<&mpsc::UnboundedSender<QueryEvent>>,
    interrupt_rx: &mut mpsc::Receiver<()>,
    options: &AgentOptions,
) -> Result<QueryResult, ClaudeError> {
    let started = Instant::now();
    let handler = StreamHandler::new();

    transport.send_user_message(&query.to_content_blocks()).await?;

    let mut response_text = String::new();
    let mut session_id: Option<String> = None;
    let mut cost = 0.0;
    let mut num_turns = 0u32;

    loop {
        let raw = tokio::select! {
            biased;
            _ = interrupt_rx.recv() => {
                transport.interrupt().await?;
                continue;
            }
            raw = transport.next_event() => raw?,
        };
        let Some(raw) = raw else {
            break;
        };

        // Permission checks arrive as control requests and are answered
        // inline from the gate; they never surface as stream events.
        if raw.get("type").and_then(Value::as_str) == Some("control_request") {
            answer_control_request(transport, &raw, options).await?;
            continue;
        }

        let extracted = handler.extract(&raw);
        let is_result = matches!(extracted.event, StreamEvent::Result { .. });
        match extracted.event {
            StreamEvent::Result {
                content,
                session_id: sid,
                cost: c,
            } => {
                response_text = content;
                session_id = sid;
                cost = c;
            }
            StreamEvent::Text { content } if !content.is_empty() => {
                forward(events, QueryEvent::Text { content });
            }
            StreamEvent::Thinking { content } if !content.is_empty() => {
                forward(events, QueryEvent::Thinking { content });
            }
            StreamEvent::ToolUse { name, input } => {
                if !extracted.partial {
                    num_turns += 1;
                }
                forward(
                    events,
                    QueryEvent::ToolUse {
                        name,
                        input,
                        partial: extracted.partial,
                    },
                );
            }
            StreamEvent::ToolResult { content } => {
                forward(events, QueryEvent::ToolResult { content });
            }
            _ => {}
        }

        if is_result {
            break;
        }
    }

    Ok(QueryResult {
        response_text,
        session_id,
        cost,
        num_turns,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn forward(events: Option<&mpsc::UnboundedSender<QueryEvent>>, event: QueryEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

async fn answer_control_request(
    transport: &mut ClaudeProcess,
    raw: &Value,
    options: &AgentOptions,
) -> Result<(), ClaudeError> {
    let Some(request_id) = raw.get("request_id").and_then(Value::as_str) else {
        return Ok(());
    };
    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    match request.get("subtype").and_then(Value::as_str) {
        Some("can_use_tool") => {
            let tool_name = request
                .get("tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let input = request.get("input").cloned().unwrap_or(Value::Null);
            let decision =
                check_tool_use(tool_name, &input, &options.approved_roots, &options.cwd);
            transport.respond_permission(request_id, &decision).await
        }
        other => {
            debug!(subtype = ?other, "ignoring unhandled control request");
            Ok(())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

//! Streaming tool calls: the active-session table, cooperative cancellation and
//! the background thread that owns one call.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::audit::{AuditEvent, AuditLog};
use crate::jsonrpc::{notification_frame, STREAM_NOTIFICATION_METHOD};
use crate::registry::{StreamToolHandler, ToolArguments};
use crate::writer::OutboundWriter;
use crate::{lock_unpoisoned, panic_message};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk,
    Complete,
    Error,
    Cancelled,
}

impl StreamEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

/// How a stream handler finished; each variant becomes exactly one terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Complete(Value),
    Cancelled(Value),
    Failed(Value),
}

impl StreamOutcome {
    fn event(&self) -> StreamEvent {
        match self {
            Self::Complete(_) => StreamEvent::Complete,
            Self::Cancelled(_) => StreamEvent::Cancelled,
            Self::Failed(_) => StreamEvent::Error,
        }
    }

    fn into_data(self) -> Value {
        match self {
            Self::Complete(data) | Self::Cancelled(data) | Self::Failed(data) => data,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    call_id: Value,
    tool: String,
    started_at: Instant,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSessionInfo {
    pub call_id: Value,
    pub tool: String,
    pub elapsed: Duration,
    pub cancel_requested: bool,
}

/// Call ids whose stream thread is still running.
///
/// Entries are keyed by the canonical JSON of the call id, so `7` and `"7"`
/// are different calls.
#[derive(Debug, Clone, Default)]
pub struct StreamSessions {
    active: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

impl StreamSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `call_id`; `None` when it is already streaming.
    pub fn begin(&self, call_id: &Value, tool: &str) -> Option<SessionGuard> {
        let key = session_key(call_id);
        let mut active = lock_unpoisoned(&self.active);
        if active.contains_key(&key) {
            return None;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        active.insert(
            key.clone(),
            SessionEntry {
                call_id: call_id.clone(),
                tool: tool.to_string(),
                started_at: Instant::now(),
                cancel: Arc::clone(&cancel),
            },
        );
        Some(SessionGuard {
            sessions: self.clone(),
            key,
            cancel,
        })
    }

    /// Sets the cancellation flag; false when the call is not active.
    pub fn cancel(&self, call_id: &Value) -> bool {
        let active = lock_unpoisoned(&self.active);
        match active.get(&session_key(call_id)) {
            Some(entry) => {
                entry.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, call_id: &Value) -> bool {
        lock_unpoisoned(&self.active).contains_key(&session_key(call_id))
    }

    pub fn active_count(&self) -> usize {
        lock_unpoisoned(&self.active).len()
    }

    pub fn snapshot(&self) -> Vec<StreamSessionInfo> {
        let active = lock_unpoisoned(&self.active);
        let mut sessions = active
            .values()
            .map(|entry| StreamSessionInfo {
                call_id: entry.call_id.clone(),
                tool: entry.tool.clone(),
                elapsed: entry.started_at.elapsed(),
                cancel_requested: entry.cancel.load(Ordering::SeqCst),
            })
            .collect::<Vec<_>>();
        sessions.sort_by(|left, right| right.elapsed.cmp(&left.elapsed));
        sessions
    }

    /// Blocks until no session is active or `timeout` passes; true when idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }

    fn remove(&self, key: &str) {
        lock_unpoisoned(&self.active).remove(key);
    }
}

fn session_key(call_id: &Value) -> String {
    call_id.to_string()
}

/// Removes its session from the table when dropped, whatever the outcome.
#[derive(Debug)]
pub struct SessionGuard {
    sessions: StreamSessions,
    key: String,
    cancel: Arc<AtomicBool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.key);
    }
}

/// Handed to a stream handler: identity, cancellation flag and a `chunk` emitter.
#[derive(Debug, Clone)]
pub struct StreamContext {
    call_id: Value,
    tool: String,
    cancel: Arc<AtomicBool>,
    writer: OutboundWriter,
    audit: Arc<AuditLog>,
}

impl StreamContext {
    pub fn call_id(&self) -> &Value {
        &self.call_id
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn chunk(&self, data: Value) {
        self.emit(StreamEvent::Chunk, data);
    }

    /// A context outside any session table, with its cancellation flag exposed.
    #[cfg(test)]
    pub(crate) fn detached(writer: OutboundWriter) -> (Self, Arc<AtomicBool>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let context = Self {
            call_id: json!("detached"),
            tool: "detached".to_string(),
            cancel: Arc::clone(&cancel),
            writer,
            audit: Arc::new(AuditLog::disabled()),
        };
        (context, cancel)
    }

    fn emit(&self, event: StreamEvent, data: Value) {
        let params = json!({
            "callId": self.call_id,
            "event": event.as_str(),
            "data": data,
        });
        if let Err(error) = self
            .writer
            .write_frame(&notification_frame(STREAM_NOTIFICATION_METHOD, params.clone()))
        {
            tracing::warn!(
                error = %format!("{error:#}"),
                call_id = %self.call_id,
                "failed to emit stream event"
            );
        }
        self.audit.record(AuditEvent::StreamEvent, params);
    }
}

/// Starts the background thread for one streaming call. The session is
/// released when the thread finishes, or immediately if it cannot be spawned.
pub(crate) fn spawn_stream(
    guard: SessionGuard,
    call_id: Value,
    tool: String,
    handler: StreamToolHandler,
    arguments: ToolArguments,
    writer: OutboundWriter,
    audit: Arc<AuditLog>,
) -> Result<()> {
    let context = StreamContext {
        call_id,
        tool,
        cancel: Arc::clone(&guard.cancel),
        writer,
        audit,
    };
    thread::Builder::new()
        .name(format!("autocode-stream-{}", guard.key))
        .spawn(move || run_stream(guard, context, handler, arguments))
        .map(|_| ())
        .context("failed to spawn stream thread")
}

fn run_stream(
    guard: SessionGuard,
    context: StreamContext,
    handler: StreamToolHandler,
    arguments: ToolArguments,
) {
    let started = Instant::now();
    let outcome = match catch_unwind(AssertUnwindSafe(|| handler(&context, &arguments))) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(error)) => StreamOutcome::Failed(json!({ "error": format!("{error:#}") })),
        Err(payload) => StreamOutcome::Failed(json!({
            "error": format!("stream handler panicked: {}", panic_message(payload.as_ref())),
        })),
    };
    let event = outcome.event();
    context.emit(event, outcome.into_data());
    tracing::debug!(
        call_id = %context.call_id,
        tool = %context.tool,
        event = event.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stream finished"
    );
    context.audit.record(
        AuditEvent::StreamEnd,
        json!({"callId": context.call_id, "tool": context.tool, "event": event.as_str()}),
    );
    drop(guard);
}

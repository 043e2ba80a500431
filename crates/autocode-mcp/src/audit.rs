use std::path::{Path, PathBuf};
use std::sync::Mutex;

use autocode_core::{append_line_with_rotation, current_utc_rfc3339, LogRotationPolicy};
use serde::Serialize;
use serde_json::Value;

use crate::lock_unpoisoned;

/// Kinds of protocol activity written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStart,
    Request,
    ParseError,
    Batch,
    ToolCall,
    StreamStart,
    StreamEvent,
    StreamCancel,
    StreamEnd,
    Error,
    ServerShutdown,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerStart => "server_start",
            Self::Request => "request",
            Self::ParseError => "parse_error",
            Self::Batch => "batch",
            Self::ToolCall => "tool_call",
            Self::StreamStart => "stream_start",
            Self::StreamEvent => "stream_event",
            Self::StreamCancel => "stream_cancel",
            Self::StreamEnd => "stream_end",
            Self::Error => "error",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditRecord<'a> {
    timestamp: String,
    event: AuditEvent,
    payload: &'a Value,
}

/// Append-only NDJSON record of requests and stream events.
///
/// The file is reopened for every record. Write failures are logged at debug
/// level and otherwise ignored.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    rotation: LogRotationPolicy,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>, rotation: LogRotationPolicy) -> Self {
        Self {
            path: Some(path.into()),
            rotation,
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            path: None,
            rotation: LogRotationPolicy::disabled(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, event: AuditEvent, payload: Value) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let record = AuditRecord {
            timestamp: current_utc_rfc3339(),
            event,
            payload: &payload,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(error) => {
                tracing::debug!(%error, event = event.as_str(), "failed to encode audit record");
                return;
            }
        };
        let _guard = lock_unpoisoned(&self.write_lock);
        if let Err(error) = append_line_with_rotation(path, &line, self.rotation) {
            tracing::debug!(
                error = %format!("{error:#}"),
                path = %path.display(),
                "audit write failed"
            );
        }
    }
}

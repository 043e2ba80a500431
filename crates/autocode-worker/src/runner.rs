use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::dialect::WorkerDialect;
use crate::error::WorkerError;
use crate::process::{ReplyWait, WorkerProcess, WorkerState};
use crate::protocol::{encode_payload, needs_wrapping, WorkerLine, TIMEOUT_MESSAGE};

const DEFAULT_STOP_GRACE_MS: u64 = 2_000;
const DEFAULT_LIVENESS_POLL_MS: u64 = 50;

pub const EMPTY_SCRIPT_MESSAGE: &str = "Empty script: nothing to evaluate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub stop_grace: Duration,
    pub liveness_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            liveness_poll_interval: Duration::from_millis(DEFAULT_LIVENESS_POLL_MS),
        }
    }
}

/// Why a call produced no usable reply.
///
/// Absent on [`RunOutcome`] when the worker answered, including when it
/// answered with an evaluation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFailureKind {
    Timeout,
    WorkerExited,
    WriteFailed,
    ReaderFailed,
    Unavailable,
}

impl RunFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::WorkerExited => "worker_exited",
            Self::WriteFailed => "write_failed",
            Self::ReaderFailed => "reader_failed",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub success: bool,
    pub payload: String,
    pub failure: Option<RunFailureKind>,
}

impl RunOutcome {
    pub fn succeeded(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: payload.into(),
            failure: None,
        }
    }

    pub fn evaluation_failed(payload: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: payload.into(),
            failure: None,
        }
    }

    pub fn failed(kind: RunFailureKind, payload: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: payload.into(),
            failure: Some(kind),
        }
    }

    fn from_reply(line: WorkerLine, captured: Vec<String>) -> Self {
        match line {
            WorkerLine::Result(value) if captured.is_empty() => Self::succeeded(value),
            WorkerLine::Result(_) => Self::succeeded(captured.join("\n")),
            WorkerLine::Error(message) => Self::evaluation_failed(message),
            WorkerLine::Output(text) => Self::succeeded(text),
        }
    }
}

/// Anything that can evaluate a script with a bounded wait.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &str, timeout: Duration) -> RunOutcome;
}

struct WorkerSlot {
    state: WorkerState,
    process: Option<WorkerProcess>,
}

/// Owns the one worker process and lets a single script run against it at a time.
///
/// The slot mutex is the call lock: it is held from the write of the script until
/// its reply (or timeout) is observed.
pub struct SingleFlightRunner {
    dialect: Arc<dyn WorkerDialect>,
    config: WorkerConfig,
    slot: Mutex<WorkerSlot>,
}

impl std::fmt::Debug for SingleFlightRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightRunner")
            .field("dialect", &self.dialect.name())
            .field("config", &self.config)
            .finish()
    }
}

impl SingleFlightRunner {
    pub fn new(dialect: Arc<dyn WorkerDialect>, config: WorkerConfig) -> Self {
        Self {
            dialect,
            config,
            slot: Mutex::new(WorkerSlot {
                state: WorkerState::Stopped,
                process: None,
            }),
        }
    }

    pub fn dialect_name(&self) -> &'static str {
        self.dialect.name()
    }

    /// Evaluates `script`, starting or restarting the worker as needed.
    #[tracing::instrument(
        name = "autocode_worker.eval",
        skip(self, script),
        fields(
            dialect = self.dialect.name(),
            script_len = script.len(),
            timeout_ms = timeout.as_millis() as u64
        )
    )]
    pub fn eval(&self, script: &str, timeout: Duration) -> RunOutcome {
        // A blank line would never be answered and would desync the reply count.
        if script.trim().is_empty() {
            return RunOutcome::evaluation_failed(EMPTY_SCRIPT_MESSAGE);
        }
        let mut slot = lock_unpoisoned(&self.slot);
        if let Err(error) = self.ensure_running(&mut slot) {
            tracing::warn!(%error, "worker unavailable");
            return RunOutcome::failed(
                RunFailureKind::Unavailable,
                format!("Failed to start worker: {error}"),
            );
        }
        let Some(process) = slot.process.as_mut() else {
            return RunOutcome::failed(RunFailureKind::Unavailable, "Worker is not running");
        };

        let line = if needs_wrapping(script) {
            self.dialect.wrap_encoded_script(&encode_payload(script))
        } else {
            script.to_string()
        };
        if let Err(error) = process.send_line(&line) {
            tracing::warn!(%error, "failed to write to worker");
            self.retire(&mut slot);
            return RunOutcome::failed(
                RunFailureKind::WriteFailed,
                format!("Failed to write to worker: {error}"),
            );
        }

        match process.await_reply(timeout, self.config.liveness_poll_interval) {
            ReplyWait::Reply { line, captured } => RunOutcome::from_reply(line, captured),
            ReplyWait::TimedOut => {
                tracing::warn!("worker call timed out; worker left running");
                RunOutcome::failed(RunFailureKind::Timeout, TIMEOUT_MESSAGE)
            }
            ReplyWait::Exited => {
                tracing::warn!("worker exited before replying");
                self.retire(&mut slot);
                RunOutcome::failed(
                    RunFailureKind::WorkerExited,
                    "Worker process exited before responding",
                )
            }
            ReplyWait::ReaderClosed => {
                tracing::warn!("worker output closed before replying");
                self.retire(&mut slot);
                RunOutcome::failed(
                    RunFailureKind::ReaderFailed,
                    "Worker output stream closed before responding",
                )
            }
        }
    }

    pub fn start(&self) -> Result<(), WorkerError> {
        let mut slot = lock_unpoisoned(&self.slot);
        self.ensure_running(&mut slot)
    }

    pub fn stop(&self) {
        let mut slot = lock_unpoisoned(&self.slot);
        if let Some(mut process) = slot.process.take() {
            tracing::info!(pid = process.pid(), "stopping worker");
            process.shutdown(self.config.stop_grace);
        }
        slot.state = WorkerState::Stopped;
    }

    pub fn restart(&self) -> Result<(), WorkerError> {
        self.stop();
        self.start()
    }

    /// Current state; a running worker that has since exited reports `Dead`.
    pub fn state(&self) -> WorkerState {
        let mut slot = lock_unpoisoned(&self.slot);
        refresh_liveness(&mut slot);
        slot.state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        let slot = lock_unpoisoned(&self.slot);
        slot.process.as_ref().map(WorkerProcess::pid)
    }

    fn ensure_running(&self, slot: &mut WorkerSlot) -> Result<(), WorkerError> {
        refresh_liveness(slot);
        if slot.state == WorkerState::Running && slot.process.is_some() {
            return Ok(());
        }
        if slot.state == WorkerState::Dead {
            tracing::info!("restarting dead worker");
        }
        if let Some(mut stale) = slot.process.take() {
            stale.shutdown(Duration::ZERO);
        }

        slot.state = WorkerState::Starting;
        match WorkerProcess::spawn(self.dialect.as_ref()) {
            Ok(process) => {
                slot.process = Some(process);
                slot.state = WorkerState::Running;
                Ok(())
            }
            Err(error) => {
                slot.state = WorkerState::Stopped;
                Err(error)
            }
        }
    }

    fn retire(&self, slot: &mut WorkerSlot) {
        if let Some(mut process) = slot.process.take() {
            process.shutdown(Duration::ZERO);
        }
        slot.state = WorkerState::Dead;
    }
}

impl ScriptExecutor for SingleFlightRunner {
    fn execute(&self, script: &str, timeout: Duration) -> RunOutcome {
        self.eval(script, timeout)
    }
}

impl Drop for SingleFlightRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn refresh_liveness(slot: &mut WorkerSlot) {
    if slot.state != WorkerState::Running {
        return;
    }
    let alive = slot
        .process
        .as_mut()
        .is_some_and(|process| !process.has_exited());
    if !alive {
        slot.state = WorkerState::Dead;
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

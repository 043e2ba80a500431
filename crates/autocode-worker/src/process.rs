use std::io::{BufRead, BufReader, PipeReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::dialect::WorkerDialect;
use crate::error::WorkerError;
use crate::protocol::{WorkerLine, WorkerMarkers};

const BOOTSTRAP_PREFIX: &str = "autocode_worker_";
const MIN_EXIT_SETTLE_MS: u64 = 250;

fn exit_settle_window(poll_interval: Duration) -> Duration {
    (poll_interval * 5).max(Duration::from_millis(MIN_EXIT_SETTLE_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Dead,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Dead => "dead",
        }
    }
}

/// What a caller observed while waiting for the reply to one submitted line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyWait {
    Reply {
        line: WorkerLine,
        captured: Vec<String>,
    },
    TimedOut,
    Exited,
    /// The output stream closed while the process was still running.
    ReaderClosed,
}

/// One live interpreter subprocess plus its bootstrap file.
///
/// stdout and stderr share a single pipe, drained by one reader thread that
/// forwards classified lines over a channel. Replies are strictly ordered, so a
/// reply abandoned by a timed-out call is skipped by counting, never matched by
/// content.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<WorkerLine>,
    bootstrap_path: Option<PathBuf>,
    markers: WorkerMarkers,
    started_at: Instant,
    abandoned_replies: usize,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.child.id())
            .field("bootstrap_path", &self.bootstrap_path)
            .field("abandoned_replies", &self.abandoned_replies)
            .finish()
    }
}

impl WorkerProcess {
    pub fn spawn(dialect: &dyn WorkerDialect) -> Result<Self, WorkerError> {
        let markers = WorkerMarkers::generate();
        let bootstrap_path = write_bootstrap(dialect, &markers)?;
        match spawn_with_bootstrap(dialect, &bootstrap_path, markers) {
            Ok(process) => Ok(process),
            Err(error) => {
                let _ = std::fs::remove_file(&bootstrap_path);
                Err(error)
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn markers(&self) -> &WorkerMarkers {
        &self.markers
    }

    pub fn bootstrap_path(&self) -> Option<&Path> {
        self.bootstrap_path.as_deref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// A dying worker closes its pipe before it can be reaped, so an exit is
    /// given a short window to become visible.
    fn exits_within(&mut self, window: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        matches!(self.child.wait_timeout(window), Ok(Some(_)))
    }

    pub fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin already closed",
            ));
        };
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        stdin.write_all(&frame)?;
        stdin.flush()
    }

    /// Waits for the next reply that belongs to the caller.
    ///
    /// Liveness is re-checked every `poll_interval`. A timed-out wait leaves one
    /// abandoned reply behind, which the next wait discards first.
    pub fn await_reply(&mut self, timeout: Duration, poll_interval: Duration) -> ReplyWait {
        let deadline = Instant::now() + timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        let mut captured = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.abandoned_replies += 1;
                return ReplyWait::TimedOut;
            }
            match self.lines.recv_timeout((deadline - now).min(poll_interval)) {
                Ok(line) => {
                    if let Some(reply) = self.accept_line(line, &mut captured) {
                        return reply;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.has_exited() {
                        return self.drain_after_exit(captured);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if self.exits_within(exit_settle_window(poll_interval)) {
                        return ReplyWait::Exited;
                    }
                    return ReplyWait::ReaderClosed;
                }
            }
        }
    }

    fn accept_line(&mut self, line: WorkerLine, captured: &mut Vec<String>) -> Option<ReplyWait> {
        if let WorkerLine::Output(text) = line {
            captured.push(text);
            return None;
        }
        if self.abandoned_replies > 0 {
            self.abandoned_replies -= 1;
            tracing::debug!(
                remaining = self.abandoned_replies,
                "discarded reply of an abandoned worker call"
            );
            captured.clear();
            return None;
        }
        Some(ReplyWait::Reply {
            line,
            captured: std::mem::take(captured),
        })
    }

    // The worker may have printed its reply just before exiting.
    fn drain_after_exit(&mut self, mut captured: Vec<String>) -> ReplyWait {
        loop {
            match self.lines.try_recv() {
                Ok(line) => {
                    if let Some(reply) = self.accept_line(line, &mut captured) {
                        return reply;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    return ReplyWait::Exited;
                }
            }
        }
    }

    /// Graceful stop: close stdin, SIGTERM, wait up to `grace`, then kill.
    /// Removes the bootstrap file. Safe to call more than once.
    pub fn shutdown(&mut self, grace: Duration) {
        self.stdin.take();
        if !self.has_exited() {
            request_terminate(&self.child);
            match self.child.wait_timeout(grace) {
                Ok(Some(status)) => {
                    tracing::debug!(pid = self.child.id(), %status, "worker exited");
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(
                        pid = self.child.id(),
                        grace_ms = grace.as_millis() as u64,
                        "worker ignored terminate request; killing"
                    );
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                }
            }
        }
        self.remove_bootstrap();
    }

    fn remove_bootstrap(&mut self) {
        if let Some(path) = self.bootstrap_path.take() {
            if let Err(error) = std::fs::remove_file(&path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        path = %path.display(),
                        %error,
                        "failed to remove worker bootstrap"
                    );
                }
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stdin.take();
        if !self.has_exited() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        self.remove_bootstrap();
    }
}

fn write_bootstrap(
    dialect: &dyn WorkerDialect,
    markers: &WorkerMarkers,
) -> Result<PathBuf, WorkerError> {
    let mut file = tempfile::Builder::new()
        .prefix(BOOTSTRAP_PREFIX)
        .suffix(dialect.bootstrap_extension())
        .tempfile()
        .map_err(WorkerError::Bootstrap)?;
    file.write_all(dialect.bootstrap_source(markers).as_bytes())
        .map_err(WorkerError::Bootstrap)?;
    file.flush().map_err(WorkerError::Bootstrap)?;
    file.into_temp_path()
        .keep()
        .map_err(|error| WorkerError::Bootstrap(error.error))
}

fn spawn_with_bootstrap(
    dialect: &dyn WorkerDialect,
    bootstrap_path: &Path,
    markers: WorkerMarkers,
) -> Result<WorkerProcess, WorkerError> {
    let (reader, writer) = std::io::pipe().map_err(WorkerError::Pipe)?;
    let stderr_writer = writer.try_clone().map_err(WorkerError::Pipe)?;
    let program = dialect.program().display().to_string();

    let mut command = Command::new(dialect.program());
    command
        .args(dialect.launch_args(bootstrap_path))
        .stdin(Stdio::piped())
        .stdout(writer)
        .stderr(stderr_writer);
    let spawned = command.spawn();
    // The command owns the parent's copies of the pipe writer; EOF on the reader
    // only arrives once they are gone.
    drop(command);
    let mut child = spawned.map_err(|source| WorkerError::Spawn {
        program: program.clone(),
        source,
    })?;

    let Some(stdin) = child.stdin.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(WorkerError::MissingStdin(program));
    };

    let lines = match spawn_output_reader(reader, markers.clone(), child.id()) {
        Ok(lines) => lines,
        Err(error) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WorkerError::Pipe(error));
        }
    };
    tracing::info!(
        pid = child.id(),
        dialect = dialect.name(),
        bootstrap = %bootstrap_path.display(),
        "worker started"
    );

    Ok(WorkerProcess {
        child,
        stdin: Some(stdin),
        lines,
        bootstrap_path: Some(bootstrap_path.to_path_buf()),
        markers,
        started_at: Instant::now(),
        abandoned_replies: 0,
    })
}

fn spawn_output_reader(
    reader: PipeReader,
    markers: WorkerMarkers,
    pid: u32,
) -> std::io::Result<Receiver<WorkerLine>> {
    let (sender, receiver) = mpsc::channel();
    thread::Builder::new()
        .name(format!("autocode-worker-output-{pid}"))
        .spawn(move || {
            let mut buffered = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match buffered.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = markers.classify(&String::from_utf8_lossy(&raw));
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::debug!(pid, %error, "worker output reader failed");
                        break;
                    }
                }
            }
        })?;
    Ok(receiver)
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: signalling a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_terminate(_child: &Child) {}

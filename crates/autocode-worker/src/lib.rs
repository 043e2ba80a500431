//! Persistent interpreter worker and the single-flight runner that drives it.
//!
//! One external interpreter process is kept alive behind a bootstrap script that
//! turns it into a line-oriented request/response loop. Callers submit scripts
//! through [`SingleFlightRunner`], which serializes calls, enforces per-call
//! timeouts and restarts the worker when it is found dead.

pub mod dialect;
pub mod error;
pub mod process;
pub mod protocol;
pub mod runner;

pub use dialect::{JuliaDialect, ShellDialect, WorkerDialect};
pub use error::WorkerError;
pub use process::{ReplyWait, WorkerProcess, WorkerState};
pub use protocol::{
    decode_payload, encode_payload, needs_wrapping, WorkerLine, WorkerMarkers,
    DECODE_ERROR_PLACEHOLDER, TIMEOUT_MESSAGE, WRAP_THRESHOLD_CHARS,
};
pub use runner::{
    RunFailureKind, RunOutcome, ScriptExecutor, SingleFlightRunner, WorkerConfig,
    EMPTY_SCRIPT_MESSAGE,
};

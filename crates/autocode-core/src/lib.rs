//! Foundational low-level utilities shared across autocode crates.
//!
//! Provides atomic file-write helpers, append-only log helpers, identifier
//! generation and time utilities used by the store, the audit log and the
//! worker runner.

pub mod atomic_io;
pub mod ids;
pub mod log_rotation;
pub mod time_utils;

pub use atomic_io::replace_file_durably;
pub use ids::next_hex_id;
pub use log_rotation::{append_line_with_rotation, LogRotationPolicy};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, current_utc_rfc3339};

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::time_utils::current_unix_timestamp_ms;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns a fresh lowercase hex identifier of `len` characters (clamped to 1..=64).
///
/// Identifiers mix the process id, wall clock and a process-wide counter through
/// SHA-256, so two calls in the same millisecond still differ.
pub fn next_hex_id(len: usize) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.subsec_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(current_unix_timestamp_ms().to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let mut encoded = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    encoded.truncate(len.clamp(1, 64));
    encoded
}

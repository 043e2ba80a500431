use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const LOG_ROTATION_MAX_BYTES_ENV: &str = "AUTOCODE_LOG_ROTATION_MAX_BYTES";
pub const LOG_ROTATION_MAX_FILES_ENV: &str = "AUTOCODE_LOG_ROTATION_MAX_FILES";
const DEFAULT_LOG_ROTATION_MAX_FILES: usize = 5;

/// Size-based rotation for append-only NDJSON logs.
///
/// `max_bytes == 0` disables rotation; the audit log runs that way unless an
/// operator opts in through the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl LogRotationPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Reads `AUTOCODE_LOG_ROTATION_MAX_BYTES` / `AUTOCODE_LOG_ROTATION_MAX_FILES`.
    /// Missing or invalid byte limits keep rotation disabled.
    pub fn from_env() -> Self {
        let max_bytes = read_positive_env::<u64>(LOG_ROTATION_MAX_BYTES_ENV).unwrap_or(0);
        let max_files = read_positive_env::<usize>(LOG_ROTATION_MAX_FILES_ENV)
            .unwrap_or(DEFAULT_LOG_ROTATION_MAX_FILES);
        Self {
            max_bytes,
            max_files,
        }
    }

    pub fn is_enabled(self) -> bool {
        self.max_bytes > 0 && self.max_files > 0
    }
}

fn read_positive_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
}

/// Appends one line to `path`, opening the file fresh for this write only.
///
/// No handle outlives the call, so every completed append is on disk even if
/// the process dies before the next one.
pub fn append_line_with_rotation(path: &Path, line: &str, policy: LogRotationPolicy) -> Result<()> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if policy.is_enabled() {
        let current = std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if current > 0 && current.saturating_add(incoming) > policy.max_bytes {
            shift_backups(path, policy.max_files)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut buffer = Vec::with_capacity(line.len() + 1);
    buffer.extend_from_slice(line.as_bytes());
    buffer.push(b'\n');
    file.write_all(&buffer)
        .with_context(|| format!("failed to append {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

/// `log -> log.1 -> log.2 ...`, dropping anything beyond `max_files - 1` backups.
fn shift_backups(path: &Path, max_files: usize) -> Result<()> {
    let keep = max_files.saturating_sub(1);
    if keep == 0 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }

    let oldest = backup_path(path, keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)
            .with_context(|| format!("failed to prune {}", oldest.display()))?;
    }
    for index in (1..keep).rev() {
        let source = backup_path(path, index);
        if source.exists() {
            let target = backup_path(path, index + 1);
            std::fs::rename(&source, &target).with_context(|| {
                format!("failed to rotate {} to {}", source.display(), target.display())
            })?;
        }
    }
    let first = backup_path(path, 1);
    std::fs::rename(path, &first)
        .with_context(|| format!("failed to rotate {} to {}", path.display(), first.display()))
}

#[cfg(test)]
mod tests {
    use super::{append_line_with_rotation, backup_path, LogRotationPolicy};

    fn read(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn functional_append_without_rotation_keeps_every_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs/autocode_mcp.log");
        for seq in 1..=20 {
            append_line_with_rotation(
                &path,
                &format!(r#"{{"seq":{seq}}}"#),
                LogRotationPolicy::disabled(),
            )
            .expect("append");
        }
        assert_eq!(read(&path).lines().count(), 20);
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn functional_append_rotation_moves_full_log_to_first_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autocode_mcp.log");
        let policy = LogRotationPolicy {
            max_bytes: 24,
            max_files: 3,
        };

        append_line_with_rotation(&path, r#"{"seq":1,"msg":"first"}"#, policy).expect("first");
        append_line_with_rotation(&path, r#"{"seq":2,"msg":"second"}"#, policy).expect("second");

        assert!(read(&backup_path(&path, 1)).contains("\"seq\":1"));
        assert!(read(&path).contains("\"seq\":2"));
    }

    #[test]
    fn regression_append_rotation_prunes_backups_to_max_files_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("autocode_mcp.log");
        let policy = LogRotationPolicy {
            max_bytes: 18,
            max_files: 2,
        };

        for seq in 1..=6 {
            append_line_with_rotation(&path, &format!(r#"{{"seq":{seq}}}"#), policy)
                .expect("append line");
        }

        assert!(backup_path(&path, 1).exists());
        assert!(!backup_path(&path, 2).exists());
        assert!(read(&path).contains("\"seq\":6"));
    }

    #[test]
    fn unit_log_rotation_policy_from_env_defaults_to_disabled() {
        std::env::set_var(super::LOG_ROTATION_MAX_BYTES_ENV, "4096");
        std::env::set_var(super::LOG_ROTATION_MAX_FILES_ENV, "7");
        let parsed = LogRotationPolicy::from_env();
        assert_eq!(parsed.max_bytes, 4096);
        assert_eq!(parsed.max_files, 7);
        assert!(parsed.is_enabled());

        std::env::set_var(super::LOG_ROTATION_MAX_BYTES_ENV, "not-a-number");
        std::env::set_var(super::LOG_ROTATION_MAX_FILES_ENV, "0");
        let fallback = LogRotationPolicy::from_env();
        assert_eq!(fallback.max_bytes, 0);
        assert_eq!(fallback.max_files, 5);
        assert!(!fallback.is_enabled());

        std::env::remove_var(super::LOG_ROTATION_MAX_BYTES_ENV);
        std::env::remove_var(super::LOG_ROTATION_MAX_FILES_ENV);
    }
}

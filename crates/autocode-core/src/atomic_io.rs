use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tempfile::NamedTempFile;

/// Replaces `path` with `bytes` in one step.
///
/// The data goes to a sibling temp file that is synced and then renamed over
/// the destination, and the directory entry is synced after the rename. A crash
/// leaves either the previous document or the new one, never a prefix.
pub fn replace_file_durably(path: &Path, bytes: &[u8]) -> Result<()> {
    let Some(file_name) = path.file_name() else {
        bail!("'{}' does not name a file", path.display());
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name.to_string_lossy()))
        .suffix(".partial")
        .tempfile_in(dir)
        .with_context(|| format!("failed to stage a temp file in {}", dir.display()))?;
    write_and_sync(&mut staged, bytes)
        .with_context(|| format!("failed to write staged copy of {}", path.display()))?;
    staged
        .persist(path)
        .map_err(|error| error.error)
        .with_context(|| format!("failed to move staged copy over {}", path.display()))?;
    sync_directory(dir)
}

fn write_and_sync(staged: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    staged.write_all(bytes)?;
    staged.as_file().sync_all()
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .with_context(|| format!("failed to sync directory {}", dir.display()))
}

// Directory handles cannot be synced on this platform; the rename is the commit.
#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> Result<()> {
    Ok(())
}

//! Size-based rotation of the JSONL audit trail.
//!
//! `audit.jsonl` → `audit.jsonl.1` → … → `audit.jsonl.5`; the oldest copy is
//! dropped. Only the file backend keeps its trail on disk this way.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cohort_core::paths::audit_log_path;

/// Number of rotated copies kept.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` once it reaches `max_bytes`.
///
/// Returns `true` if rotation occurred. Missing files are not an error.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        if src.exists() {
            fs::rename(&src, numbered_path(log_path, n + 1))?;
        }
    }
    // Appenders reopen by path, so the next event creates a fresh file.
    fs::rename(log_path, numbered_path(log_path, 1))?;
    Ok(true)
}

/// Rotate the audit trail under `coordination_dir`. Failures are logged.
pub fn rotate_audit(coordination_dir: &Path, max_bytes: u64) -> bool {
    let path = audit_log_path(coordination_dir);
    match rotate_if_needed(&path, max_bytes, MAX_ROTATED_FILES) {
        Ok(true) => {
            tracing::info!(path = %path.display(), "audit trail rotated");
            true
        }
        Ok(false) => false,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "audit rotation failed");
            false
        }
    }
}

/// `<base>.<n>`, e.g. `audit.jsonl.2`.
pub fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("audit.jsonl");
    base.with_file_name(format!("{name}.{n}"))
}

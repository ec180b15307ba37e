//! JSONL journal with lease-guarded appends.
//!
//! Appends are a single `O_APPEND` write of one complete line followed by
//! `sync_data`. A crash can still leave a torn final line; readers skip any
//! line that does not parse, and the next append starts on a fresh line.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use cohort_core::LockType;
use cohort_engine::{AcquireOutcome, Coordinator, DenyReason};

use crate::error::{io_err, SyncError};

/// Lease attempts before an append gives up.
pub const DEFAULT_LEASE_ATTEMPTS: u32 = 20;

const LEASE_RETRY_STEP: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    lease_attempts: u32,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lease_attempts: DEFAULT_LEASE_ATTEMPTS,
        }
    }

    pub fn with_lease_attempts(mut self, attempts: u32) -> Self {
        self.lease_attempts = attempts.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line while holding the journal lease of `coord`'s instance.
    pub fn append<T: Serialize>(&self, coord: &Coordinator, line: &T) -> Result<(), SyncError> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');

        let _lease = Lease::take(coord, &self.path, self.lease_attempts)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        if ends_torn(&mut file).map_err(|e| io_err(&self.path, e))? {
            bytes.insert(0, b'\n');
        }
        file.write_all(&bytes)
            .and_then(|()| file.sync_data())
            .map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    /// Every parseable line, in append order. A missing journal is empty.
    pub fn read<T: DeserializeOwned>(&self) -> Result<Vec<T>, SyncError> {
        let text = match std::fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&self.path, e)),
        };
        let mut out = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(entry) => out.push(entry),
                Err(e) => tracing::warn!(
                    journal = %self.path.display(),
                    line = n + 1,
                    error = %e,
                    "skipping unreadable journal line"
                ),
            }
        }
        Ok(out)
    }
}

/// Whether a non-empty file lacks its trailing newline.
fn ends_torn(file: &mut std::fs::File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive lock on a journal file, released on drop.
struct Lease<'a> {
    coord: &'a Coordinator,
    path: &'a Path,
}

impl<'a> Lease<'a> {
    fn take(coord: &'a Coordinator, path: &'a Path, attempts: u32) -> Result<Self, SyncError> {
        let ttl = Some(coord.config().journal_lock_ttl());
        let mut last = String::new();
        for attempt in 1..=attempts {
            match coord.acquire_file_lock(path, LockType::ExclusiveWrite, ttl, "journal append")? {
                AcquireOutcome::Granted { .. } | AcquireOutcome::Reclaimed { .. } => {
                    return Ok(Self { coord, path });
                }
                denied @ AcquireOutcome::Denied {
                    reason: DenyReason::StoreUnavailable,
                    ..
                } => {
                    return Err(SyncError::Busy {
                        path: path.to_path_buf(),
                        reason: denied.message(),
                    })
                }
                denied => {
                    last = denied.message();
                    if attempt < attempts {
                        std::thread::sleep(LEASE_RETRY_STEP * attempt);
                    }
                }
            }
        }
        tracing::debug!(journal = %path.display(), attempts, "journal lease not granted");
        Err(SyncError::Busy {
            path: path.to_path_buf(),
            reason: last,
        })
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.coord.release_file_lock(self.path) {
            tracing::warn!(journal = %self.path.display(), error = %e, "failed to release journal lease");
        }
    }
}

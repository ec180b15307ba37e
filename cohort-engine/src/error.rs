//! Error types for cohort-engine.

use std::path::PathBuf;

use thiserror::Error;

use cohort_core::{BackendKind, CoreError, HolderInfo, InstanceId};
use cohort_detector::DetectError;
use cohort_store::StoreError;

/// Errors surfaced by the coordination engine.
///
/// Lock contention during `acquire` is not an error; it is reported as a
/// denied outcome. These variants cover store failures, invalid input and
/// operations attempted by an instance that is not entitled to them.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("capability detection failed: {0}")]
    Detect(#[from] DetectError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A live lock of another instance prevented the operation.
    #[error("{} is locked: {holder}", path.display())]
    Conflict { path: PathBuf, holder: HolderInfo },

    /// Extend or release by an instance that is not the live holder.
    #[error("{} is held by {holder}, not by this instance", path.display())]
    NotHolder { path: PathBuf, holder: InstanceId },

    /// Extend of a lock this instance does not hold.
    #[error("no live lock held on {}", path.display())]
    NotHeld { path: PathBuf },

    #[error("invalid TTL {secs}s: must be greater than zero")]
    InvalidTtl { secs: i64 },

    #[error("the {backend:?} backend has no mailbox; use the sqlite backend")]
    MailboxUnsupported { backend: BackendKind },

    #[error("no registered instance for context '{context}'")]
    UnknownInstance { context: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoordError {
    CoordError::Io {
        path: path.into(),
        source,
    }
}

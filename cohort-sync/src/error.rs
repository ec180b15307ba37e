//! Error types for cohort-sync.

use std::path::PathBuf;

use thiserror::Error;

use cohort_engine::CoordError;

/// All errors that can arise from journal operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The journal lease could not be taken within the retry budget.
    #[error("journal {} is busy: {reason}", path.display())]
    Busy { path: PathBuf, reason: String },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

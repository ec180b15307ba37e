//! Error types for cohort-store.

use std::path::PathBuf;

use thiserror::Error;

use cohort_core::{CoreError, InstanceId};

/// All errors a lock store can report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing directory or database cannot be reached at all.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    /// A persisted record that does not parse.
    #[error("corrupt record at {path}: {message}")]
    CorruptRecord { path: PathBuf, message: String },

    /// Another process holds the per-path guard.
    #[error("lock store contended for {path}")]
    Contended { path: PathBuf },

    /// Delete attempted by an instance that does not hold the live lock.
    #[error("{path} is held by {holder}")]
    NotHolder { path: PathBuf, holder: InstanceId },
}

impl StoreError {
    /// Errors that mean "the store could not be consulted", as opposed to a
    /// decision about the lock itself.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StoreError::Unavailable { .. }
            | StoreError::Io { .. }
            | StoreError::Sqlite(_)
            | StoreError::Core(_) => true,
            StoreError::Json(_)
            | StoreError::CorruptRecord { .. }
            | StoreError::Contended { .. }
            | StoreError::NotHolder { .. } => false,
        }
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

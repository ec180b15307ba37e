//! Error types for cohort-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from configuration loading and path handling.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure, with the path it happened on.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on a config file.
    #[error("failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Config values that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A path that cannot be turned into a lock key.
    #[error("invalid lock path '{path}': {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Convenience constructor for [`CoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

//! Error types for backup and restore.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

/// Errors that can occur while snapshotting or restoring a deployment.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("backup not found: {0}")]
    NotFound(String),

    /// The deployment could not be brought back. Not retried.
    #[error("restore failed: {0}")]
    Restore(String),

    #[error("backup task failed: {0}")]
    Task(String),
}

impl BackupError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the deployment may now be in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackupError::Restore(_))
    }
}

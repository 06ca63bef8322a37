//! Error types for release lookup and artifact staging.

use std::path::PathBuf;

use thiserror::Error;

use reforge_core::{ServiceError, SourceError};

pub type ReleaseResult<T> = Result<T, ReleaseError>;
pub type StageResult<T> = Result<T, StageError>;

/// Failures talking to a release source.
#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("no releases found in {0}")]
    NoRelease(String),

    #[error("release {tag} has no asset matching '{pattern}'")]
    NoAsset { tag: String, pattern: String },

    #[error("release I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failures turning a downloaded artifact into a staged tree.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("archive entry escapes the staging directory: {0}")]
    UnsafePath(String),

    #[error("archive contains no files")]
    Empty,
}

impl StageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures while replacing the live tree. Every one triggers a rollback.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("stopping service: {0}")]
    Stop(#[source] ServiceError),

    #[error("copying release into {path}: {source}")]
    Copy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("writing version marker {path}: {source}")]
    Marker {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("dependency refresh `{command}` failed: {reason}")]
    Refresh { command: String, reason: String },

    #[error("starting service: {0}")]
    Start(#[source] ServiceError),
}

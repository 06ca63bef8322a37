//! Release source URI resolution.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReleaseSourceUri {
    /// GitHub releases: github://owner/repo
    Github { owner: String, repo: String },
    /// Local release directory: file:///srv/releases or /srv/releases
    Directory { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid source URI: {0}")]
    InvalidUri(String),
}

impl ReleaseSourceUri {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if let Some(rest) = uri.strip_prefix("github://") {
            let (owner, repo) = rest
                .trim_end_matches('/')
                .split_once('/')
                .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
            if owner.is_empty() || repo.is_empty() || repo.contains('/') {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ReleaseSourceUri::Github {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })
        } else if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(ReleaseSourceUri::Directory {
                path: PathBuf::from(path),
            })
        } else if uri.starts_with('/') || uri.starts_with("./") {
            Ok(ReleaseSourceUri::Directory {
                path: PathBuf::from(uri),
            })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            ReleaseSourceUri::Github { .. } => "github",
            ReleaseSourceUri::Directory { .. } => "file",
        }
    }
}

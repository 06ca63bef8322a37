//! Domain types shared by the health, backup and rollout crates.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Boxed future used by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Version ────────────────────────────────────────────────────────

/// An installed or available release tag.
///
/// Tags are opaque strings. When both sides parse as semver (a leading
/// `v` is tolerated) they are also ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Version reported when no marker file exists yet.
    pub const UNKNOWN: &'static str = "0.0.0";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into().trim().to_string())
    }

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse as semver, ignoring a leading `v`.
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(self.0.trim_start_matches('v')).ok()
    }

    /// Whether two tags name the same release (`v1.2.0` == `1.2.0`).
    pub fn same_release(&self, other: &Version) -> bool {
        if self.0 == other.0 {
            return true;
        }
        match (self.semver(), other.semver()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// True only when both tags parse as semver and `self < other`.
    pub fn is_older_than(&self, other: &Version) -> bool {
        match (self.semver(), other.semver()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── Health endpoint ────────────────────────────────────────────────

/// URL of the service's health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthEndpoint(String);

impl HealthEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn url(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HealthEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Deployment ─────────────────────────────────────────────────────

/// The installed application tree, its version marker and health endpoint.
///
/// The version marker normally lives inside the tree, so a snapshot of the
/// tree also captures the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentState {
    pub root: PathBuf,
    pub version_file: PathBuf,
    pub health_endpoint: HealthEndpoint,
}

impl DeploymentState {
    /// Build a deployment description. A relative `version_file` is
    /// resolved against `root`.
    pub fn new(root: &Path, version_file: &Path, health_endpoint: HealthEndpoint) -> Self {
        let version_file = if version_file.is_absolute() {
            version_file.to_path_buf()
        } else {
            root.join(version_file)
        };
        Self {
            root: root.to_path_buf(),
            version_file,
            health_endpoint,
        }
    }

    /// Whether the version marker lives inside the deployment tree, so that
    /// snapshots of the tree carry it along.
    pub fn marker_in_tree(&self) -> bool {
        self.version_file.starts_with(&self.root)
    }

    /// Read the installed version. A missing marker reads as [`Version::UNKNOWN`].
    pub fn installed_version(&self) -> io::Result<Version> {
        match std::fs::read_to_string(&self.version_file) {
            Ok(content) => {
                let line = content.lines().next().unwrap_or_default().trim();
                if line.is_empty() {
                    Ok(Version::unknown())
                } else {
                    Ok(Version::new(line))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Version::unknown()),
            Err(e) => Err(e),
        }
    }

    /// Persist the version marker as a single line (write-then-rename).
    pub fn write_version(&self, version: &Version) -> io::Result<()> {
        if let Some(parent) = self.version_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.version_file.with_extension("tmp");
        std::fs::write(&tmp, format!("{version}\n"))?;
        std::fs::rename(&tmp, &self.version_file)
    }
}

// ── Health verdicts ────────────────────────────────────────────────

/// A single failed check within a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailureKind {
    ProcessNotRunning,
    HttpUnreachable,
    HttpBadStatus,
    HighCpu,
    HighMemory,
    HighDisk,
}

impl ProbeFailureKind {
    /// Resource breaches are advisory and never make a verdict unhealthy.
    pub fn is_advisory(self) -> bool {
        matches!(self, Self::HighCpu | Self::HighMemory | Self::HighDisk)
    }
}

impl fmt::Display for ProbeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProcessNotRunning => "process not running",
            Self::HttpUnreachable => "http unreachable",
            Self::HttpBadStatus => "http bad status",
            Self::HighCpu => "high cpu load",
            Self::HighMemory => "high memory usage",
            Self::HighDisk => "high disk usage",
        };
        f.write_str(s)
    }
}

/// Classified result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy { reasons: BTreeSet<ProbeFailureKind> },
}

impl HealthVerdict {
    /// Derive a verdict from every failure a probe observed.
    pub fn from_failures(failures: &BTreeSet<ProbeFailureKind>) -> Self {
        if failures.iter().all(|f| f.is_advisory()) {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Unhealthy {
                reasons: failures.clone(),
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "HEALTHY"),
            HealthVerdict::Unhealthy { reasons } => {
                let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                write!(f, "UNHEALTHY: {}", reasons.join(", "))
            }
        }
    }
}

/// Anything that can render a point-in-time health verdict.
pub trait Prober: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, HealthVerdict>;
}

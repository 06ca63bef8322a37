//! Reforge update episodes: fetch a newer release, install it, verify it,
//! and roll back when it does not come up healthy.
//!
//! # Components
//!
//! - **`release`** — Release sources (GitHub releases, local directory)
//! - **`staging`** — Checksum verification and archive extraction
//! - **`apply`** — Overlaying a staged release onto the live tree
//! - **`controller`** — The update episode state machine

pub mod apply;
pub mod controller;
pub mod error;
pub mod release;
pub mod staging;

pub use apply::{apply_release, RefreshCommand};
pub use controller::{
    RollbackReason, UpdateEpisode, UpdateFailure, UpdateOrchestrator, UpdatePhase, UpdatePolicy,
    UpdateReport, UpdateResult,
};
pub use error::{ApplyError, ReleaseError, ReleaseResult, StageError, StageResult};
pub use release::{
    from_config, AssetLocation, DirectoryReleases, FetchedArtifact, GithubReleases, Release,
    ReleaseSource,
};

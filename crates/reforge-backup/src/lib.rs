//! Deployment snapshots for Reforge.
//!
//! A backup is a full copy of the deployment tree stored under the backups
//! directory, named by creation time, with a JSON sidecar describing it:
//!
//! ```text
//! /var/backups/reforge/
//!   backup-20260301T020000.000Z/        full tree (includes VERSION)
//!   backup-20260301T020000.000Z.json    { name, created_at, version }
//!   .backup-20260302T020000.000Z.partial   in-flight copy, never listed
//! ```
//!
//! Only the newest `retention` backups are kept.

pub mod copy;
pub mod error;
pub mod manager;

pub use copy::{clear_dir, copy_tree};
pub use error::{BackupError, BackupResult};
pub use manager::{Backup, BackupManager};

//! Process exit codes.
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | healthy, recovered, up to date, updated, or skipped (lock held) |
//! | 1    | restart attempts exhausted |
//! | 2    | update failed before changing the deployment |
//! | 3    | update rolled back |
//! | 4    | restoring a backup failed |
//! | 5    | configuration, usage or startup error (including an unknown backup name) |
//! | 130  | interrupted by shutdown |

use reforge_backup::BackupError;
use reforge_health::{CheckOutcome, HealResult};
use reforge_rollout::{RollbackReason, UpdateFailure, UpdateReport, UpdateResult};

pub const OK: u8 = 0;
pub const EXHAUSTED: u8 = 1;
pub const UPDATE_FAILED: u8 = 2;
pub const ROLLED_BACK: u8 = 3;
pub const RESTORE_FAILED: u8 = 4;
pub const CONFIG: u8 = 5;
pub const INTERRUPTED: u8 = 130;

/// Result of a single episode run from the command line.
#[derive(Debug)]
pub enum Episode {
    /// Another episode held the deployment lock.
    Skipped,
    Check(CheckOutcome),
    Update(UpdateReport),
}

impl Episode {
    pub fn exit_code(&self) -> u8 {
        match self {
            Episode::Skipped => OK,
            Episode::Check(outcome) => check_code(outcome),
            Episode::Update(report) => update_code(&report.result),
        }
    }
}

pub fn check_code(outcome: &CheckOutcome) -> u8 {
    match outcome {
        CheckOutcome::Healthy => OK,
        CheckOutcome::Healed(report) => match report.result {
            HealResult::Recovered { .. } => OK,
            HealResult::Exhausted { .. } => EXHAUSTED,
            HealResult::Interrupted { .. } => INTERRUPTED,
        },
    }
}

pub fn update_code(result: &UpdateResult) -> u8 {
    match result {
        UpdateResult::UpToDate | UpdateResult::Updated(_) => OK,
        UpdateResult::RolledBack(RollbackReason::Interrupted) => INTERRUPTED,
        UpdateResult::RolledBack(_) => ROLLED_BACK,
        UpdateResult::Failed(UpdateFailure::Restore) => RESTORE_FAILED,
        UpdateResult::Failed(_) => UPDATE_FAILED,
    }
}

/// Exit code for a manual `backup restore` that did not complete. Only a
/// restore that started touching the tree is fatal.
pub fn restore_error_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<BackupError>() {
        Some(e) if e.is_fatal() => RESTORE_FAILED,
        _ => CONFIG,
    }
}

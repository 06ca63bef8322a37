//! Update orchestrator: drives one update episode end to end.
//!
//! ```text
//! Checking → BackingUp → Staging → Applying → Verifying → Completed
//!     │          │          │          │           │
//!  UpToDate   Failed     Failed        └──→ RollingBack ←──┘
//! ```
//!
//! Nothing in the live tree changes before the backup exists. Once the tree
//! has been touched the episode either verifies the new release healthy or
//! restores the backup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use reforge_backup::{Backup, BackupManager};
use reforge_core::config::UpdateConfig;
use reforge_core::{
    DeploymentState, HealthVerdict, Notification, Notifier, Prober, ServiceControl, Version,
};

use crate::apply::{apply_release, RefreshCommand};
use crate::release::ReleaseSource;
use crate::staging;

/// Current phase of an update episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdatePhase {
    Checking,
    BackingUp,
    Staging,
    Applying,
    Verifying,
    RollingBack,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RollbackReason {
    /// Installing the release failed.
    Apply,
    /// The new release never reported healthy.
    HealthCheckTimeout,
    /// Shutdown arrived while verifying.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdateFailure {
    VersionLookup,
    Backup,
    Download,
    Stage,
    /// Restoring the backup failed; the deployment state is unknown.
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdateResult {
    UpToDate,
    Updated(Version),
    RolledBack(RollbackReason),
    Failed(UpdateFailure),
}

/// What happened during one update episode.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct UpdateEpisode {
    pub current: Option<Version>,
    pub latest: Option<Version>,
    /// Name of the backup taken before mutation.
    pub backup: Option<String>,
    pub staged: Option<PathBuf>,
    pub apply_error: Option<String>,
    pub health_polls: u32,
    /// Verdict of the last post-apply poll.
    pub verdict: Option<HealthVerdict>,
    /// Error that ended the episode early, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UpdateReport {
    pub result: UpdateResult,
    pub episode: UpdateEpisode,
}

/// Verification and refresh settings for update episodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub max_health_attempts: u32,
    pub poll_interval: Duration,
    pub refresh: Option<RefreshCommand>,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            max_health_attempts: 30,
            poll_interval: Duration::from_secs(10),
            refresh: None,
        }
    }
}

impl From<&UpdateConfig> for UpdatePolicy {
    fn from(config: &UpdateConfig) -> Self {
        Self {
            max_health_attempts: config.max_health_attempts,
            poll_interval: config.poll_interval,
            refresh: config
                .refresh_command
                .as_ref()
                .filter(|c| !c.trim().is_empty())
                .map(|c| RefreshCommand::new(c.clone(), config.refresh_timeout)),
        }
    }
}

enum Verification {
    Healthy,
    TimedOut,
    Interrupted,
}

/// Runs update episodes against one deployment.
pub struct UpdateOrchestrator {
    state: DeploymentState,
    service: Arc<dyn ServiceControl>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    source: Arc<dyn ReleaseSource>,
    backups: BackupManager,
    policy: UpdatePolicy,
}

impl UpdateOrchestrator {
    pub fn new(
        state: DeploymentState,
        service: Arc<dyn ServiceControl>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        source: Arc<dyn ReleaseSource>,
        backups: BackupManager,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            state,
            service,
            prober,
            notifier,
            source,
            backups,
            policy,
        }
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    /// Run one update episode.
    pub async fn run_update(&self, shutdown: &watch::Receiver<bool>) -> UpdateReport {
        let mut episode = UpdateEpisode::default();
        let mut phase = UpdatePhase::Checking;
        info!(source = %self.source.describe(), "checking for updates");

        let current = match self.state.installed_version() {
            Ok(v) => v,
            Err(e) => {
                let msg = format!("reading {}: {e}", self.state.version_file.display());
                return self.fail(episode, UpdateFailure::VersionLookup, msg);
            }
        };
        episode.current = Some(current.clone());

        let release = match self.source.latest().await {
            Ok(release) => release,
            Err(e) => return self.fail(episode, UpdateFailure::VersionLookup, e.to_string()),
        };
        let latest = release.version.clone();
        episode.latest = Some(latest.clone());

        if current.same_release(&latest) {
            info!(version = %current, "already up to date");
            return finish(episode, UpdateResult::UpToDate);
        }
        if latest.is_older_than(&current) {
            warn!(installed = %current, latest = %latest, "latest release is older than installed, not downgrading");
            return finish(episode, UpdateResult::UpToDate);
        }
        info!(installed = %current, latest = %latest, "update available");

        phase = advance(phase, UpdatePhase::BackingUp);
        let backup = match self.backups.create_backup(&self.state).await {
            Ok(backup) => backup,
            Err(e) => return self.fail(episode, UpdateFailure::Backup, e.to_string()),
        };
        episode.backup = Some(backup.name.clone());

        phase = advance(phase, UpdatePhase::Staging);
        let scratch = match tempfile::Builder::new().prefix("reforge-stage-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return self.fail(episode, UpdateFailure::Stage, e.to_string()),
        };
        let fetched = match self.source.fetch(&release, scratch.path()).await {
            Ok(fetched) => fetched,
            Err(e) => return self.fail(episode, UpdateFailure::Download, e.to_string()),
        };
        let extract_dir = scratch.path().join("release");
        let staged = tokio::task::spawn_blocking(move || {
            staging::stage(
                &fetched.archive,
                fetched.expected_sha256.as_deref(),
                &extract_dir,
            )
        })
        .await;
        let staged = match staged {
            Ok(Ok(root)) => root,
            Ok(Err(e)) => return self.fail(episode, UpdateFailure::Stage, e.to_string()),
            Err(e) => return self.fail(episode, UpdateFailure::Stage, e.to_string()),
        };
        episode.staged = Some(staged.clone());

        phase = advance(phase, UpdatePhase::Applying);
        if let Err(e) = apply_release(
            &staged,
            &latest,
            &self.state,
            self.service.as_ref(),
            self.policy.refresh.as_ref(),
        )
        .await
        {
            error!(version = %latest, error = %e, "applying release failed");
            episode.apply_error = Some(e.to_string());
            return self.roll_back(phase, &backup, episode, RollbackReason::Apply).await;
        }
        drop(scratch);

        phase = advance(phase, UpdatePhase::Verifying);
        match self.verify(shutdown, &mut episode).await {
            Verification::Healthy => {}
            Verification::TimedOut => {
                return self
                    .roll_back(phase, &backup, episode, RollbackReason::HealthCheckTimeout)
                    .await;
            }
            Verification::Interrupted => {
                return self
                    .roll_back(phase, &backup, episode, RollbackReason::Interrupted)
                    .await;
            }
        }

        advance(phase, UpdatePhase::Completed);
        info!(from = %current, to = %latest, "update completed");
        self.notifier.notify(Notification::info(
            "update completed",
            format!("{} updated from {current} to {latest}", self.service.name()),
        ));
        finish(episode, UpdateResult::Updated(latest))
    }

    /// Poll the prober until healthy, the budget is spent, or shutdown.
    async fn verify(
        &self,
        shutdown: &watch::Receiver<bool>,
        episode: &mut UpdateEpisode,
    ) -> Verification {
        let max = self.policy.max_health_attempts;
        for poll in 1..=max {
            if *shutdown.borrow() {
                warn!(poll, "shutdown requested during verification");
                return Verification::Interrupted;
            }
            if !self.policy.poll_interval.is_zero() {
                tokio::time::sleep(self.policy.poll_interval).await;
            }

            let verdict = self.prober.probe().await;
            episode.health_polls = poll;
            let healthy = verdict.is_healthy();
            debug!(poll, max, %verdict, "post-update health poll");
            episode.verdict = Some(verdict);
            if healthy {
                info!(poll, "new release healthy");
                return Verification::Healthy;
            }
        }
        warn!(polls = max, "new release never became healthy");
        Verification::TimedOut
    }

    async fn roll_back(
        &self,
        phase: UpdatePhase,
        backup: &Backup,
        mut episode: UpdateEpisode,
        reason: RollbackReason,
    ) -> UpdateReport {
        advance(phase, UpdatePhase::RollingBack);
        warn!(backup = %backup.name, ?reason, "rolling back");

        if let Err(e) = self
            .backups
            .restore(backup, &self.state, self.service.as_ref())
            .await
        {
            error!(backup = %backup.name, error = %e, "restore failed, deployment state unknown");
            episode.error = Some(e.to_string());
            self.notifier.notify(Notification::critical(
                "rollback failed",
                format!(
                    "{}: restoring {} failed ({e}); manual intervention required",
                    self.service.name(),
                    backup.name
                ),
            ));
            return finish(episode, UpdateResult::Failed(UpdateFailure::Restore));
        }

        let attempted = episode
            .latest
            .as_ref()
            .map(Version::to_string)
            .unwrap_or_default();
        self.notifier.notify(Notification::warning(
            "update rolled back",
            format!(
                "{}: update to {attempted} rolled back ({reason:?}); restored {}",
                self.service.name(),
                backup.name
            ),
        ));
        finish(episode, UpdateResult::RolledBack(reason))
    }

    fn fail(&self, mut episode: UpdateEpisode, failure: UpdateFailure, message: String) -> UpdateReport {
        error!(?failure, error = %message, "update aborted before changing the deployment");
        self.notifier.notify(Notification::warning(
            "update failed",
            format!("{}: update aborted at {failure:?}: {message}", self.service.name()),
        ));
        episode.error = Some(message);
        finish(episode, UpdateResult::Failed(failure))
    }
}

fn finish(episode: UpdateEpisode, result: UpdateResult) -> UpdateReport {
    UpdateReport { result, episode }
}

fn advance(from: UpdatePhase, to: UpdatePhase) -> UpdatePhase {
    info!(?from, ?to, "update phase");
    to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_config() {
        let mut config = UpdateConfig::default();
        config.max_health_attempts = 7;
        config.poll_interval = Duration::from_millis(250);
        config.refresh_command = Some("pip install -r requirements.txt".into());

        let policy = UpdatePolicy::from(&config);
        assert_eq!(policy.max_health_attempts, 7);
        assert_eq!(policy.poll_interval, Duration::from_millis(250));
        assert_eq!(
            policy.refresh.map(|r| r.command),
            Some("pip install -r requirements.txt".to_string())
        );
    }

    #[test]
    fn blank_refresh_command_is_ignored() {
        let mut config = UpdateConfig::default();
        config.refresh_command = Some("   ".into());
        assert!(UpdatePolicy::from(&config).refresh.is_none());
    }

    #[test]
    fn default_policy_matches_config_defaults() {
        let from_config = UpdatePolicy::from(&UpdateConfig::default());
        assert_eq!(from_config, UpdatePolicy::default());
    }
}

//! Episode wiring: builds the collaborators from configuration and runs
//! one healing or update episode under the deployment lock.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use reforge_backup::{Backup, BackupManager};
use reforge_core::{
    notify, DeploymentLock, DeploymentState, Notifier, Prober, ReforgeConfig, ServiceControl,
    SystemdService,
};
use reforge_health::{HealthProbe, ProbeReport, RestartEscalator, RestartPolicy};
use reforge_rollout::{ReleaseSource, UpdateOrchestrator, UpdatePolicy};

use crate::exit::Episode;

/// Everything needed to run episodes against one deployment.
pub struct Supervisor {
    config: ReforgeConfig,
    state: DeploymentState,
    service: Arc<dyn ServiceControl>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    source: Arc<dyn ReleaseSource>,
    backups: BackupManager,
    probe: Option<Arc<HealthProbe>>,
}

impl Supervisor {
    /// Production wiring: systemd, the HTTP/resource probe, the configured
    /// notifier and release source.
    pub fn from_config(config: ReforgeConfig) -> anyhow::Result<Self> {
        let state = config.deployment_state();
        let service: Arc<dyn ServiceControl> = Arc::new(SystemdService::new(
            &config.service.name,
            config.service.command_timeout,
        ));
        let probe = Arc::new(HealthProbe::new(service.clone(), &state, &config.health));
        let notifier = notify::from_config(&config.notify, &config.service.name);
        let source: Arc<dyn ReleaseSource> = reforge_rollout::from_config(&config.update)
            .context("building release source")?
            .into();

        let mut supervisor = Self::new(config, service, probe.clone(), notifier, source);
        supervisor.probe = Some(probe);
        Ok(supervisor)
    }

    pub fn new(
        config: ReforgeConfig,
        service: Arc<dyn ServiceControl>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        source: Arc<dyn ReleaseSource>,
    ) -> Self {
        Self {
            state: config.deployment_state(),
            backups: BackupManager::from_config(&config.deployment),
            config,
            service,
            prober,
            notifier,
            source,
            probe: None,
        }
    }

    pub fn config(&self) -> &ReforgeConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    fn open_lock(&self) -> anyhow::Result<DeploymentLock> {
        let path = &self.config.deployment.lock_file;
        DeploymentLock::open(path)
            .with_context(|| format!("opening deployment lock {}", path.display()))
    }

    /// Probe once and heal if unhealthy.
    pub async fn check(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<Episode> {
        let mut lock = self.open_lock()?;
        let Some(_guard) = lock.try_acquire().context("acquiring deployment lock")? else {
            info!("deployment lock held by another episode, skipping health check");
            return Ok(Episode::Skipped);
        };

        let escalator = RestartEscalator::new(
            self.service.clone(),
            self.prober.clone(),
            self.notifier.clone(),
            RestartPolicy::from(&self.config.heal),
        );
        Ok(Episode::Check(escalator.check_and_heal(shutdown).await))
    }

    /// Run one update episode.
    pub async fn update(&self, shutdown: &watch::Receiver<bool>) -> anyhow::Result<Episode> {
        let mut lock = self.open_lock()?;
        let Some(_guard) = lock.try_acquire().context("acquiring deployment lock")? else {
            info!("deployment lock held by another episode, skipping update");
            return Ok(Episode::Skipped);
        };

        let orchestrator = UpdateOrchestrator::new(
            self.state.clone(),
            self.service.clone(),
            self.prober.clone(),
            self.notifier.clone(),
            self.source.clone(),
            self.backups.clone(),
            UpdatePolicy::from(&self.config.update),
        );
        Ok(Episode::Update(orchestrator.run_update(shutdown).await))
    }

    /// A full probe report without remediation. `None` when the prober is
    /// not the HTTP/resource probe.
    pub async fn probe_report(&self) -> Option<ProbeReport> {
        match &self.probe {
            Some(probe) => Some(probe.inspect().await),
            None => None,
        }
    }

    /// Take a backup outside an update. `None` when the lock is held.
    pub async fn create_backup(&self) -> anyhow::Result<Option<Backup>> {
        let mut lock = self.open_lock()?;
        let Some(_guard) = lock.try_acquire().context("acquiring deployment lock")? else {
            warn!("deployment lock held by another episode, not creating backup");
            return Ok(None);
        };
        let backup = self
            .backups
            .create_backup(&self.state)
            .await
            .context("creating backup")?;
        Ok(Some(backup))
    }

    /// Restore the named backup (`latest` for the newest). `None` when the
    /// lock is held.
    pub async fn restore_backup(&self, name: &str) -> anyhow::Result<Option<Backup>> {
        let mut lock = self.open_lock()?;
        let Some(_guard) = lock.try_acquire().context("acquiring deployment lock")? else {
            warn!("deployment lock held by another episode, not restoring");
            return Ok(None);
        };
        let backup = self.backups.find(name)?;
        self.backups
            .restore(&backup, &self.state, self.service.as_ref())
            .await
            .with_context(|| format!("restoring {}", backup.name))?;
        Ok(Some(backup))
    }
}

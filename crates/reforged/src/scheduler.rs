//! Built-in scheduler: periodic health checks and update episodes.
//!
//! Health checks start immediately; the first update runs one update
//! interval after startup. A tick that finds the deployment lock held is
//! skipped. Exhausted or failed episodes are logged and the loop keeps
//! going until shutdown.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use reforge_core::config::ScheduleConfig;

use crate::exit::{self, Episode};
use crate::supervisor::Supervisor;

pub async fn run(
    supervisor: &Supervisor,
    schedule: &ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) -> u8 {
    info!(
        health_interval = ?schedule.health_interval,
        update_interval = ?schedule.update_interval,
        "scheduler started"
    );

    let mut health = interval(non_zero(schedule.health_interval));
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let update_every = non_zero(schedule.update_interval);
    let mut update = interval_at(Instant::now() + update_every, update_every);
    update.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = health.tick() => {
                report("health check", supervisor.check(&shutdown).await);
            }
            _ = update.tick() => {
                report("update", supervisor.update(&shutdown).await);
            }
            _ = shutdown.changed() => {
                info!("scheduler shutting down");
                break;
            }
        }
        if *shutdown.borrow() {
            info!("scheduler shutting down");
            break;
        }
    }
    exit::OK
}

fn non_zero(d: Duration) -> Duration {
    d.max(Duration::from_millis(1))
}

fn report(what: &str, result: anyhow::Result<Episode>) {
    match result {
        Ok(Episode::Skipped) => {}
        Ok(episode) => {
            let code = episode.exit_code();
            if code == exit::OK {
                info!(episode = what, outcome = ?episode, "episode finished");
            } else {
                warn!(episode = what, code, outcome = ?episode, "episode did not succeed");
            }
        }
        Err(e) => error!(episode = what, error = %format!("{e:#}"), "episode could not run"),
    }
}

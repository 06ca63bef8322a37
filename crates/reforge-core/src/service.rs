//! Process control for the supervised service.
//!
//! The supervisor never manages the process directly; it asks the init
//! system. [`SystemdService`] shells out to `systemctl` with a bounded
//! timeout so a wedged unit cannot hang an episode.

use std::ffi::OsString;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::types::BoxFuture;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to run `{verb}` for {unit}: {source}")]
    Spawn {
        verb: &'static str,
        unit: String,
        source: std::io::Error,
    },

    #[error("`{verb}` for {unit} exited with {status}: {stderr}")]
    CommandFailed {
        verb: &'static str,
        unit: String,
        status: String,
        stderr: String,
    },

    #[error("`{verb}` for {unit} timed out after {timeout:?}")]
    Timeout {
        verb: &'static str,
        unit: String,
        timeout: Duration,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Start/stop/restart/is-active operations on a named service.
pub trait ServiceControl: Send + Sync {
    /// Name of the supervised unit.
    fn name(&self) -> &str;

    fn start(&self) -> BoxFuture<'_, ServiceResult<()>>;

    fn stop(&self) -> BoxFuture<'_, ServiceResult<()>>;

    fn restart(&self) -> BoxFuture<'_, ServiceResult<()>>;

    /// Whether the service process is currently active.
    fn is_active(&self) -> BoxFuture<'_, ServiceResult<bool>>;
}

/// `systemctl`-backed service control.
#[derive(Debug, Clone)]
pub struct SystemdService {
    unit: String,
    program: OsString,
    timeout: Duration,
}

impl SystemdService {
    pub fn new(unit: &str, timeout: Duration) -> Self {
        Self {
            unit: unit.to_string(),
            program: OsString::from("systemctl"),
            timeout,
        }
    }

    /// Use a different control binary (e.g. a wrapper script).
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, verb: &'static str, args: &[&str]) -> ServiceResult<std::process::Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg(&self.unit).kill_on_drop(true);

        debug!(unit = %self.unit, verb, "running service command");

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ServiceError::Spawn {
                verb,
                unit: self.unit.clone(),
                source,
            }),
            Err(_) => Err(ServiceError::Timeout {
                verb,
                unit: self.unit.clone(),
                timeout: self.timeout,
            }),
        }
    }

    async fn run_checked(&self, verb: &'static str) -> ServiceResult<()> {
        let output = self.run(verb, &[verb]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::CommandFailed {
                verb,
                unit: self.unit.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

impl ServiceControl for SystemdService {
    fn name(&self) -> &str {
        &self.unit
    }

    fn start(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.run_checked("start"))
    }

    fn stop(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.run_checked("stop"))
    }

    fn restart(&self) -> BoxFuture<'_, ServiceResult<()>> {
        Box::pin(self.run_checked("restart"))
    }

    fn is_active(&self) -> BoxFuture<'_, ServiceResult<bool>> {
        Box::pin(async move {
            // `is-active --quiet` reports purely through the exit status.
            let output = self.run("is-active", &["is-active", "--quiet"]).await?;
            Ok(output.status.success())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn is_active_follows_exit_status() {
        let up = SystemdService::new("app", Duration::from_secs(5)).with_program("true");
        assert!(up.is_active().await.unwrap());

        let down = SystemdService::new("app", Duration::from_secs(5)).with_program("false");
        assert!(!down.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn failing_command_is_reported() {
        let svc = SystemdService::new("app", Duration::from_secs(5)).with_program("false");
        let err = svc.restart().await.unwrap_err();
        assert!(matches!(err, ServiceError::CommandFailed { verb: "restart", .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let svc = SystemdService::new("app", Duration::from_secs(5))
            .with_program("/nonexistent/reforge-systemctl");
        let err = svc.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::Spawn { verb: "start", .. }));
    }

    #[test]
    fn name_is_the_unit() {
        let svc = SystemdService::new("chalice.service", Duration::from_secs(1));
        assert_eq!(svc.name(), "chalice.service");
    }
}

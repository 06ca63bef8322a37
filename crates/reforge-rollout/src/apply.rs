//! Installing a staged release over the live tree.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use reforge_backup::copy_tree;
use reforge_core::{DeploymentState, ServiceControl, Version};

use crate::error::ApplyError;

/// Shell command run in the deployment root after new files land,
/// typically to reinstall dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCommand {
    pub command: String,
    pub timeout: Duration,
}

impl RefreshCommand {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub async fn run(&self, cwd: &Path) -> Result<(), ApplyError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(cwd)
            .kill_on_drop(true);

        debug!(command = %self.command, cwd = %cwd.display(), "running dependency refresh");

        let failed = |reason: String| ApplyError::Refresh {
            command: self.command.clone(),
            reason,
        };
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => return Err(failed(format!("timed out after {:?}", self.timeout))),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(())
    }
}

/// Stop the service, overlay `staged` onto the deployment root, record
/// `version`, refresh dependencies and start the service again.
pub async fn apply_release(
    staged: &Path,
    version: &Version,
    state: &DeploymentState,
    service: &dyn ServiceControl,
    refresh: Option<&RefreshCommand>,
) -> Result<(), ApplyError> {
    service.stop().await.map_err(ApplyError::Stop)?;

    let source = staged.to_path_buf();
    let root = state.root.clone();
    let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &root, None))
        .await
        .map_err(|e| ApplyError::Copy {
            path: state.root.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| ApplyError::Copy {
            path: state.root.clone(),
            source,
        })?;
    debug!(files = copied, root = %state.root.display(), "release files copied");

    state
        .write_version(version)
        .map_err(|source| ApplyError::Marker {
            path: state.version_file.clone(),
            source,
        })?;

    if let Some(refresh) = refresh {
        refresh.run(&state.root).await?;
    }

    service.start().await.map_err(ApplyError::Start)?;
    info!(%version, files = copied, "release applied");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    use reforge_core::testing::ScriptedService;
    use reforge_core::HealthEndpoint;

    fn deployment(root: &Path) -> DeploymentState {
        fs::create_dir_all(root).unwrap();
        fs::write(root.join("main.py"), "v1").unwrap();
        fs::write(root.join("settings.local"), "operator edits").unwrap();
        DeploymentState::new(root, Path::new("VERSION"), HealthEndpoint::new("http://127.0.0.1:1/"))
    }

    fn staged(dir: &Path) -> std::path::PathBuf {
        let staged = dir.join("staged");
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("main.py"), "v2").unwrap();
        staged
    }

    #[tokio::test]
    async fn overlays_files_and_writes_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let state = deployment(&tmp.path().join("app"));
        let staged = staged(tmp.path());
        let service = ScriptedService::new();

        apply_release(&staged, &Version::new("v2.0.0"), &state, &service, None)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(state.root.join("main.py")).unwrap(), "v2");
        assert_eq!(
            fs::read_to_string(state.root.join("settings.local")).unwrap(),
            "operator edits"
        );
        assert_eq!(state.installed_version().unwrap(), Version::new("v2.0.0"));
        assert_eq!(service.calls(), vec!["stop", "start"]);
    }

    #[tokio::test]
    async fn refresh_runs_in_deployment_root() {
        let tmp = tempfile::tempdir().unwrap();
        let state = deployment(&tmp.path().join("app"));
        let staged = staged(tmp.path());
        let refresh = RefreshCommand::new("touch refreshed.flag", Duration::from_secs(5));

        apply_release(&staged, &Version::new("v2"), &state, &ScriptedService::new(), Some(&refresh))
            .await
            .unwrap();

        assert!(state.root.join("refreshed.flag").exists());
    }

    #[tokio::test]
    async fn failing_refresh_aborts_before_start() {
        let tmp = tempfile::tempdir().unwrap();
        let state = deployment(&tmp.path().join("app"));
        let staged = staged(tmp.path());
        let refresh = RefreshCommand::new("echo broken >&2; exit 3", Duration::from_secs(5));
        let service = ScriptedService::new();

        let err = apply_release(&staged, &Version::new("v2"), &state, &service, Some(&refresh))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::Refresh { ref reason, .. } if reason.contains("broken")));
        assert_eq!(service.count("start"), 0);
    }

    #[tokio::test]
    async fn refresh_timeout_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let refresh = RefreshCommand::new("sleep 5", Duration::from_millis(50));
        let err = refresh.run(tmp.path()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let state = deployment(&tmp.path().join("app"));
        let staged = staged(tmp.path());
        let service = ScriptedService::new().failing_start();

        let err = apply_release(&staged, &Version::new("v2"), &state, &service, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Start(_)));
    }

    #[tokio::test]
    async fn stop_failure_aborts_before_touching_files() {
        let tmp = tempfile::tempdir().unwrap();
        let state = deployment(&tmp.path().join("app"));
        let staged = staged(tmp.path());
        let service = ScriptedService::new().failing_stop();

        let err = apply_release(&staged, &Version::new("v2"), &state, &service, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::Stop(_)));
        assert_eq!(fs::read_to_string(state.root.join("main.py")).unwrap(), "v1");
    }
}

//! Snapshot creation, retention and restore.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use reforge_core::config::DeploymentConfig;
use reforge_core::{DeploymentState, ServiceControl, Version};

use crate::copy::{clear_dir, copy_tree};
use crate::error::{BackupError, BackupResult};

const NAME_PREFIX: &str = "backup-";
const NAME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// A completed snapshot of the deployment tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Installed version when the snapshot was taken, if it could be read.
    pub version: Option<Version>,
    #[serde(skip)]
    pub path: PathBuf,
}

impl Backup {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.created_at)
    }
}

/// Creates, prunes and restores backups in a directory it owns exclusively.
///
/// Clones share one lock, so at most one create or restore runs at a time.
#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
    retention: usize,
    ops: Arc<Mutex<()>>,
}

impl BackupManager {
    /// Manage backups under `dir`, keeping the newest `retention` (at least 1).
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
            ops: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self::new(config.backups_dir.clone(), config.retention)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Snapshot the deployment tree, then prune old backups.
    ///
    /// A copy failure removes the partial snapshot and is returned as
    /// [`BackupError::Io`]. Pruning failures are only logged.
    pub async fn create_backup(&self, state: &DeploymentState) -> BackupResult<Backup> {
        let _guard = self.ops.lock().await;

        let dir = self.dir.clone();
        let state = state.clone();
        let backup = tokio::task::spawn_blocking(move || snapshot(&dir, &state))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))??;

        info!(
            backup = %backup.name,
            version = backup.version.as_ref().map(Version::as_str).unwrap_or("-"),
            "backup created"
        );

        let dir = self.dir.clone();
        let retention = self.retention;
        let keep = backup.name.clone();
        match tokio::task::spawn_blocking(move || prune(&dir, retention, &keep)).await {
            Ok(removed) if removed > 0 => debug!(removed, retention, "pruned old backups"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "backup pruning task failed"),
        }

        Ok(backup)
    }

    /// Replace the deployment tree with `backup` and restart the service.
    ///
    /// A failure to stop the service is logged and the restore continues.
    /// Copy or start failures are fatal ([`BackupError::Restore`]).
    pub async fn restore(
        &self,
        backup: &Backup,
        state: &DeploymentState,
        service: &dyn ServiceControl,
    ) -> BackupResult<()> {
        let _guard = self.ops.lock().await;
        info!(backup = %backup.name, root = %state.root.display(), "restoring backup");

        if let Err(e) = service.stop().await {
            warn!(error = %e, "failed to stop service before restore, continuing");
        }

        let source = backup.path.clone();
        let root = state.root.clone();
        tokio::task::spawn_blocking(move || replace_tree(&source, &root))
            .await
            .map_err(|e| BackupError::Restore(format!("restore task failed: {e}")))?
            .map_err(|e| {
                BackupError::Restore(format!(
                    "copying {} into {}: {e}",
                    backup.path.display(),
                    state.root.display()
                ))
            })?;

        if !state.marker_in_tree() {
            restore_marker(backup, state)?;
        }

        service
            .start()
            .await
            .map_err(|e| BackupError::Restore(format!("service did not start after restore: {e}")))?;

        info!(backup = %backup.name, "restore complete");
        Ok(())
    }

    /// All completed backups, oldest first.
    pub fn list(&self) -> BackupResult<Vec<Backup>> {
        list_backups(&self.dir)
    }

    /// The most recent backup, if any.
    pub fn latest(&self) -> BackupResult<Option<Backup>> {
        Ok(self.list()?.pop())
    }

    /// Look up a backup by name; `latest` selects the newest.
    pub fn find(&self, name: &str) -> BackupResult<Backup> {
        if name == "latest" {
            return self
                .latest()?
                .ok_or_else(|| BackupError::NotFound("no backups exist".to_string()));
        }
        self.list()?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| BackupError::NotFound(name.to_string()))
    }
}

fn snapshot(dir: &Path, state: &DeploymentState) -> BackupResult<Backup> {
    fs::create_dir_all(dir).map_err(|e| BackupError::io(dir, e))?;

    let now = Utc::now();
    let name = unique_name(dir, &now);
    let partial = dir.join(format!(".{name}.partial"));
    if partial.exists() {
        fs::remove_dir_all(&partial).map_err(|e| BackupError::io(&partial, e))?;
    }

    let version = match state.installed_version() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "could not read installed version for backup metadata");
            None
        }
    };

    if let Err(e) = copy_tree(&state.root, &partial, Some(dir)) {
        if let Err(cleanup) = fs::remove_dir_all(&partial) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                warn!(path = %partial.display(), error = %cleanup, "failed to remove partial backup");
            }
        }
        return Err(BackupError::io(&state.root, e));
    }

    let path = dir.join(&name);
    fs::rename(&partial, &path).map_err(|e| BackupError::io(&path, e))?;

    let backup = Backup {
        name,
        created_at: now.timestamp_millis(),
        version,
        path,
    };
    write_metadata(dir, &backup)?;
    Ok(backup)
}

/// Timestamp name for a new backup, suffixed when it would collide.
fn unique_name(dir: &Path, now: &DateTime<Utc>) -> String {
    let base = format!("{NAME_PREFIX}{}", now.format(NAME_FORMAT));
    let taken = |name: &str| {
        dir.join(name).exists() || dir.join(format!(".{name}.partial")).exists()
    };
    if !taken(&base) {
        return base;
    }
    let mut n = 1u32;
    loop {
        let candidate = format!("{base}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn metadata_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

fn write_metadata(dir: &Path, backup: &Backup) -> BackupResult<()> {
    let path = metadata_path(dir, &backup.name);
    let json = serde_json::to_vec_pretty(backup)
        .map_err(|e| BackupError::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
    fs::write(&path, json).map_err(|e| BackupError::io(&path, e))
}

fn read_metadata(dir: &Path, name: &str, path: PathBuf) -> Backup {
    let sidecar = metadata_path(dir, name);
    let parsed = fs::read(&sidecar)
        .ok()
        .and_then(|raw| serde_json::from_slice::<Backup>(&raw).ok());

    match parsed {
        Some(mut backup) if backup.name == name => {
            backup.path = path;
            backup
        }
        _ => {
            // No usable sidecar: fall back to the directory mtime.
            let created_at = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or(0);
            Backup {
                name: name.to_string(),
                created_at,
                version: None,
                path,
            }
        }
    }
}

fn list_backups(dir: &Path) -> BackupResult<Vec<Backup>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackupError::io(dir, e)),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BackupError::io(dir, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(NAME_PREFIX) || !entry.path().is_dir() {
            continue;
        }
        backups.push(read_metadata(dir, &name, entry.path()));
    }

    backups.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(backups)
}

/// Delete all but the newest `retention` backups, always keeping `keep`.
/// Returns how many were removed.
fn prune(dir: &Path, retention: usize, keep: &str) -> usize {
    let backups = match list_backups(dir) {
        Ok(backups) => backups,
        Err(e) => {
            warn!(error = %e, "could not list backups for pruning");
            return 0;
        }
    };
    let others: Vec<Backup> = backups.into_iter().filter(|b| b.name != keep).collect();
    let excess = others.len().saturating_sub(retention.saturating_sub(1));

    let mut removed = 0;
    for backup in others.into_iter().take(excess) {
        if let Err(e) = fs::remove_dir_all(&backup.path) {
            warn!(backup = %backup.name, error = %e, "failed to delete old backup");
            continue;
        }
        let sidecar = metadata_path(dir, &backup.name);
        if let Err(e) = fs::remove_file(&sidecar) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %sidecar.display(), error = %e, "failed to delete backup metadata");
            }
        }
        removed += 1;
    }
    removed
}

/// Put back the version marker recorded with `backup` when the marker lives
/// outside the restored tree.
fn restore_marker(backup: &Backup, state: &DeploymentState) -> BackupResult<()> {
    let Some(version) = &backup.version else {
        warn!(
            backup = %backup.name,
            marker = %state.version_file.display(),
            "backup has no recorded version, marker left as is"
        );
        return Ok(());
    };
    state.write_version(version).map_err(|e| {
        BackupError::Restore(format!(
            "writing version marker {}: {e}",
            state.version_file.display()
        ))
    })?;
    debug!(version = %version, "version marker restored");
    Ok(())
}

fn replace_tree(source: &Path, root: &Path) -> io::Result<()> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("backup {} is missing", source.display()),
        ));
    }
    clear_dir(root)?;
    copy_tree(source, root, None)?;
    Ok(())
}

//! reforge.toml configuration parser.
//!
//! Every section has defaults, so an empty file is a valid configuration.
//! Environment overrides are applied on top of the file by
//! [`ReforgeConfig::apply_env`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;
use crate::source::ReleaseSourceUri;
use crate::types::{DeploymentState, HealthEndpoint};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid environment override {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReforgeConfig {
    pub service: ServiceConfig,
    pub deployment: DeploymentConfig,
    pub health: HealthConfig,
    pub heal: HealConfig,
    pub update: UpdateConfig,
    pub notify: NotifyConfig,
    pub log: LogConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// systemd unit of the supervised service.
    pub name: String,
    /// Upper bound for a single start/stop/restart/is-active command.
    #[serde(with = "serde_str")]
    pub command_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "reforge-app".to_string(),
            command_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub root: PathBuf,
    /// Version marker; relative paths resolve against `root`.
    pub version_file: PathBuf,
    pub backups_dir: PathBuf,
    /// Number of backups kept after each new snapshot.
    pub retention: usize,
    pub lock_file: PathBuf,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/opt/reforge/app"),
            version_file: PathBuf::from("VERSION"),
            backups_dir: PathBuf::from("/var/backups/reforge"),
            retention: 5,
            lock_file: PathBuf::from("/var/lib/reforge/reforge.lock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub url: String,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
    /// 5-minute load average above which `HighCpu` is reported.
    pub cpu_load_threshold: f64,
    pub memory_percent_threshold: f64,
    pub disk_percent_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/health".to_string(),
            timeout: Duration::from_secs(10),
            cpu_load_threshold: 10.0,
            memory_percent_threshold: 90.0,
            disk_percent_threshold: 90.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    pub max_attempts: u32,
    #[serde(with = "serde_str")]
    pub restart_delay: Duration,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            restart_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Release source URI (`github://owner/repo` or `file:///dir`).
    pub source: String,
    /// Substring selecting the release asset to download.
    pub asset_pattern: String,
    pub max_health_attempts: u32,
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
    #[serde(with = "serde_str")]
    pub download_timeout: Duration,
    /// Shell command run in the deployment root after new files land.
    pub refresh_command: Option<String>,
    #[serde(with = "serde_str")]
    pub refresh_timeout: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            source: "file:///var/lib/reforge/releases".to_string(),
            asset_pattern: ".zip".to_string(),
            max_health_attempts: 30,
            poll_interval: Duration::from_secs(10),
            download_timeout: Duration::from_secs(300),
            refresh_command: None,
            refresh_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook receiving JSON notifications. Unset disables notifications.
    pub webhook_url: Option<String>,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Append-only log file in addition to stderr.
    pub file: Option<PathBuf>,
    /// Write the log file as JSON lines instead of plain text.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "serde_str")]
    pub health_interval: Duration,
    #[serde(with = "serde_str")]
    pub update_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(300),
            update_interval: Duration::from_secs(86_400),
        }
    }
}

impl ReforgeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `REFORGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("REFORGE_SERVICE") {
            self.service.name = v;
        }
        if let Some(v) = lookup("REFORGE_HEALTH_URL") {
            self.health.url = v;
        }
        if let Some(v) = lookup("REFORGE_DEPLOY_ROOT") {
            self.deployment.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("REFORGE_BACKUP_DIR") {
            self.deployment.backups_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("REFORGE_RELEASE_SOURCE") {
            self.update.source = v;
        }
        if let Some(v) = lookup("REFORGE_NOTIFY_URL") {
            self.notify.webhook_url = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("REFORGE_LOG_FILE") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("REFORGE_MAX_RESTARTS") {
            self.heal.max_attempts = parse_count("REFORGE_MAX_RESTARTS", &v)?;
        }
        if let Some(v) = lookup("REFORGE_MAX_HEALTH_POLLS") {
            self.update.max_health_attempts = parse_count("REFORGE_MAX_HEALTH_POLLS", &v)?;
        }
        Ok(())
    }

    /// Reject configurations the supervisor cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Invalid("service.name is empty".into()));
        }
        if self.heal.max_attempts == 0 {
            return Err(ConfigError::Invalid("heal.max_attempts must be at least 1".into()));
        }
        if self.update.max_health_attempts == 0 {
            return Err(ConfigError::Invalid(
                "update.max_health_attempts must be at least 1".into(),
            ));
        }
        if self.deployment.retention == 0 {
            return Err(ConfigError::Invalid("deployment.retention must be at least 1".into()));
        }
        if !self.health.url.starts_with("http://") {
            return Err(ConfigError::Invalid(format!(
                "health.url must be a plain http:// URL, got {}",
                self.health.url
            )));
        }
        for (name, value) in [
            ("health.memory_percent_threshold", self.health.memory_percent_threshold),
            ("health.disk_percent_threshold", self.health.disk_percent_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0-100")));
            }
        }
        if self.deployment.backups_dir.starts_with(&self.deployment.root) {
            return Err(ConfigError::Invalid(
                "deployment.backups_dir must not be inside deployment.root".into(),
            ));
        }
        if self.deployment.root.starts_with(&self.deployment.backups_dir) {
            return Err(ConfigError::Invalid(
                "deployment.root must not be inside deployment.backups_dir".into(),
            ));
        }
        ReleaseSourceUri::parse(&self.update.source)
            .map_err(|e| ConfigError::Invalid(format!("update.source: {e}")))?;
        Ok(())
    }

    /// The deployment this configuration supervises.
    pub fn deployment_state(&self) -> DeploymentState {
        DeploymentState::new(
            &self.deployment.root,
            &self.deployment.version_file,
            HealthEndpoint::new(self.health.url.clone()),
        )
    }
}

fn parse_count(var: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim().parse::<u32>().map_err(|e| ConfigError::Env {
        var,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ReforgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, ReforgeConfig::default());
        assert_eq!(config.heal.max_attempts, 3);
        assert_eq!(config.heal.restart_delay, Duration::from_secs(60));
        assert_eq!(config.update.max_health_attempts, 30);
        assert_eq!(config.update.poll_interval, Duration::from_secs(10));
        assert_eq!(config.deployment.retention, 5);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[service]
name = "chalice"

[heal]
max_attempts = 5
restart_delay = "30s"

[update]
source = "github://acme/chalice"
poll_interval = "500ms"
"#;
        let config = ReforgeConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.service.name, "chalice");
        assert_eq!(config.heal.max_attempts, 5);
        assert_eq!(config.heal.restart_delay, Duration::from_secs(30));
        assert_eq!(config.update.poll_interval, Duration::from_millis(500));
        assert_eq!(config.update.max_health_attempts, 30);
    }

    #[test]
    fn invalid_duration_is_a_parse_error() {
        let err = ReforgeConfig::from_toml_str("[heal]\nrestart_delay = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn overflowing_duration_is_a_parse_error() {
        let err = ReforgeConfig::from_toml_str("[heal]\nrestart_delay = \"999999999999999999m\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut config = ReforgeConfig::default();
        config.notify.webhook_url = Some("https://hooks.example.com/x".into());
        let rendered = config.to_toml_string().unwrap();
        let back = ReforgeConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("REFORGE_SERVICE", "api"),
            ("REFORGE_HEALTH_URL", "http://127.0.0.1:9000/healthz"),
            ("REFORGE_MAX_RESTARTS", "7"),
            ("REFORGE_NOTIFY_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = ReforgeConfig::default();
        config.notify.webhook_url = Some("https://hooks.example.com/x".into());
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.service.name, "api");
        assert_eq!(config.health.url, "http://127.0.0.1:9000/healthz");
        assert_eq!(config.heal.max_attempts, 7);
        assert_eq!(config.notify.webhook_url, None);
    }

    #[test]
    fn env_override_rejects_bad_count() {
        let mut config = ReforgeConfig::default();
        let err = config
            .apply_overrides(|k| (k == "REFORGE_MAX_RESTARTS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let mut config = ReforgeConfig::default();
        config.heal.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ReforgeConfig::default();
        config.deployment.retention = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_https_health_url() {
        let mut config = ReforgeConfig::default();
        config.health.url = "https://example.com/health".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_backups_inside_root() {
        let mut config = ReforgeConfig::default();
        config.deployment.backups_dir = config.deployment.root.join("backups");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_root_inside_backups() {
        let mut config = ReforgeConfig::default();
        config.deployment.backups_dir = PathBuf::from("/var/lib/reforge");
        config.deployment.root = PathBuf::from("/var/lib/reforge/app");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("deployment.root"), "{err}");
    }

    #[test]
    fn log_json_defaults_off() {
        let config = ReforgeConfig::from_toml_str("[log]\nlevel = \"debug\"\n").unwrap();
        assert!(!config.log.json);
        let config = ReforgeConfig::from_toml_str("[log]\njson = true\n").unwrap();
        assert!(config.log.json);
    }

    #[test]
    fn deployment_state_resolves_relative_marker() {
        let config = ReforgeConfig::default();
        let state = config.deployment_state();
        assert_eq!(state.version_file, PathBuf::from("/opt/reforge/app/VERSION"));
        assert_eq!(state.health_endpoint.url(), "http://127.0.0.1:8000/health");
    }
}

//! reforged — the Reforge supervisor.
//!
//! Keeps one long-running service healthy and up to date:
//! - Health checks with bounded restart escalation
//! - Update episodes with backup, verification and rollback
//! - Manual backup listing, creation and restore
//! - An optional built-in scheduler
//!
//! # Usage
//!
//! ```text
//! reforged --config /etc/reforge/reforge.toml check
//! reforged update
//! reforged backup restore latest
//! reforged run
//! ```
//!
//! Each subcommand except `run` performs exactly one episode and exits with
//! a code describing its outcome (see [`exit`]).

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use reforge_core::ReforgeConfig;

mod exit;
mod logging;
mod scheduler;
mod supervisor;

use exit::Episode;
use supervisor::Supervisor;

const DEFAULT_CONFIG: &str = "/etc/reforge/reforge.toml";

#[derive(Parser)]
#[command(
    name = "reforged",
    about = "Self-healing and self-update supervisor for a single service",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file. Missing default file means built-in defaults.
    #[arg(short, long, global = true, env = "REFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level (RUST_LOG still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the service and restart it if unhealthy.
    Check,
    /// Install the latest release if it differs from the installed one.
    Update,
    /// Print a probe report without taking any action.
    Probe {
        /// Print JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Manage deployment backups.
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
    /// Run health checks and updates on a schedule until interrupted.
    Run,
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backups, oldest first.
    List,
    /// Snapshot the deployment now.
    Create,
    /// Restore a backup by name, or `latest`.
    Restore { name: String },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ReforgeConfig> {
    let mut config = match path {
        Some(path) => ReforgeConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ReforgeConfig::from_file(Path::new(DEFAULT_CONFIG))?
        }
        None => ReforgeConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("reforged: configuration error: {e:#}");
            return ExitCode::from(exit::CONFIG);
        }
    };
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    logging::init(&config.log);

    match execute(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "reforged failed");
            ExitCode::from(exit::CONFIG)
        }
    }
}

async fn execute(command: Command, config: ReforgeConfig) -> anyhow::Result<u8> {
    if let Command::Config = command {
        print!("{}", config.to_toml_string()?);
        return Ok(exit::OK);
    }

    let supervisor = Supervisor::from_config(config)?;
    let shutdown = shutdown_on_signal();

    match command {
        Command::Check => finish(supervisor.check(&shutdown).await?),
        Command::Update => {
            let episode = supervisor.update(&shutdown).await?;
            if let Episode::Update(report) = &episode {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
            finish(episode)
        }
        Command::Probe { json } => {
            let report = supervisor
                .probe_report()
                .await
                .context("health probe unavailable")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.verdict());
                for advisory in report.advisories() {
                    println!("advisory: {advisory}");
                }
            }
            Ok(exit::OK)
        }
        Command::Backup { action } => run_backup(&supervisor, action).await,
        Command::Run => {
            let schedule = supervisor.config().schedule.clone();
            Ok(scheduler::run(&supervisor, &schedule, shutdown).await)
        }
        Command::Config => Ok(exit::OK),
    }
}

fn finish(episode: Episode) -> anyhow::Result<u8> {
    let code = episode.exit_code();
    info!(code, outcome = ?episode, "episode finished");
    Ok(code)
}

async fn run_backup(supervisor: &Supervisor, action: BackupAction) -> anyhow::Result<u8> {
    match action {
        BackupAction::List => {
            for backup in supervisor.backups().list()? {
                let when = backup
                    .created_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                let version = backup
                    .version
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{when}\t{version}", backup.name);
            }
            Ok(exit::OK)
        }
        BackupAction::Create => {
            if let Some(backup) = supervisor.create_backup().await? {
                println!("{}", backup.name);
            }
            Ok(exit::OK)
        }
        BackupAction::Restore { name } => match supervisor.restore_backup(&name).await {
            Ok(Some(backup)) => {
                println!("restored {}", backup.name);
                Ok(exit::OK)
            }
            Ok(None) => Ok(exit::OK),
            Err(e) => {
                error!(error = %format!("{e:#}"), "restore failed");
                Ok(exit::restore_error_code(&e))
            }
        },
    }
}

/// A channel flipped to `true` on Ctrl-C or SIGTERM.
fn shutdown_on_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "cannot listen for SIGTERM, only Ctrl-C will stop reforged");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backup_restore() {
        let cli = Cli::try_parse_from(["reforged", "--config", "/tmp/r.toml", "backup", "restore", "latest"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/r.toml")));
        assert!(matches!(
            cli.command,
            Command::Backup { action: BackupAction::Restore { ref name } } if name == "latest"
        ));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/reforge.toml"))).is_err());
    }

    #[test]
    fn config_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reforge.toml");
        std::fs::write(&path, "[service]\nname = \"chalice\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().service.name, "chalice");

        std::fs::write(&path, "[heal]\nmax_attempts = 0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}

//! Tracing setup: human-readable stderr plus an optional append-only file,
//! written as plain text or JSON lines.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use reforge_core::config::LogConfig;

/// `RUST_LOG` wins; otherwise the configured level, then `info`.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn file_layer(file: File, json: bool) -> BoxedLayer {
    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Mutex::new(file));
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber. A log file that cannot be opened is
/// reported and skipped.
pub fn init(config: &LogConfig) {
    let mut file_error = None;
    let file = config.file.as_deref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(file_layer(file, config.json)),
        Err(e) => {
            file_error = Some((path.to_path_buf(), e));
            None
        }
    });

    Registry::default()
        .with(file)
        .with(filter(&config.level))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Some((path, e)) = file_error {
        tracing::warn!(path = %path.display(), error = %e, "cannot open log file, logging to stderr only");
    }
}

//! Tracing setup: filtered, non-blocking daily log file plus optional stderr.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConfig, paths};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "PARLEY_LOG";

const LOG_FILE_PREFIX: &str = "parley.log";

/// Installs the global subscriber, writing under `${PARLEY_HOME}/logs`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
    init_in(&paths::logs_dir(), config)
}

/// Same as [`init`] with an explicit log directory.
pub fn init_in(dir: &Path, config: &LogConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = rolling::daily(dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(file_writer);

    let stderr_layer = config.stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::registry()
        .with(filter(config))
        .with(file_layer)
        .with(stderr_layer)
        .try_init();

    Ok(guard)
}

fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

//! Structured logging for the agent.
//!
//! `run` writes JSON events to a rotated file under the log directory and,
//! unless disabled, mirrors them to stderr. `policy` only logs to stderr.
//! `RUST_LOG` takes precedence over the configured level.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogRotation, LoggingConfig};

/// File name prefix for rotated agent logs.
const LOG_FILE_PREFIX: &str = "fleet-agent.log";

/// Keeps the non-blocking file writer alive. Dropping it flushes pending
/// events.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the daemon subscriber: JSON to `{logs_dir}/fleet-agent.log.*`,
/// plus stderr when `config.console` is set.
///
/// # Errors
///
/// Returns an error if the logs directory or file appender cannot be
/// created, or a global subscriber is already installed.
pub fn init_daemon(logs_dir: &Path, config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation(config.rotation))
        .filename_prefix(LOG_FILE_PREFIX);
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder
        .build(logs_dir)
        .with_context(|| format!("failed to open log file in {}", logs_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = tracing_subscriber::fmt::layer().json().with_writer(writer);
    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter(&config.level))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Stderr-only logging for one-shot subcommands. A second call is a no-op.
pub fn init_cli(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` if set, else `level`, else `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

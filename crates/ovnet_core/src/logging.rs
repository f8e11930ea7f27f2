//! Tracing setup for the overlay daemon and for tests.
//!
//! Events go to daily rolled files under the configured log directory and,
//! for the daemon, to a compact console layer as well. The overlay crates
//! follow the configured level while dependencies stay at `warn`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::OverlayConfig;

/// Targets whose events follow the configured level.
const OVERLAY_TARGETS: [&str; 3] = ["ovnet_core", "ovnet_driver", "ovnetd"];

const LOG_FILE_PREFIX: &str = "ovnet";
const LOG_FILE_SUFFIX: &str = "log";

/// Rolled files kept on disk.
const MAX_LOG_FILES: usize = 14;

/// Filter directives putting the overlay crates at `level` and everything
/// else at `warn`.
pub fn overlay_filter(level: &str) -> String {
    std::iter::once("warn".to_string())
        .chain(OVERLAY_TARGETS.iter().map(|t| format!("{t}={level}")))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

fn rolling_writer(logs_dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory: {}", logs_dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(logs_dir)
        .context("Failed to create log file appender")?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Daemon logging: rolled files in the configured directory plus compact
/// console output. `RUST_LOG` overrides the configured level.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the life of the process.
pub fn init_logging(config: &OverlayConfig) -> Result<WorkerGuard> {
    let logs_dir = config.log_directory()?;
    let (writer, guard) = rolling_writer(&logs_dir)?;

    tracing_subscriber::registry()
        .with(env_or(&overlay_filter(&config.log_level)))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer),
        )
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    info!(
        logs_dir = %logs_dir.display(),
        level = %config.log_level,
        "Overlay logging initialized"
    );
    Ok(guard)
}

/// File-only logging in `logs_dir` with explicit filter directives.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    let (writer, guard) = rolling_writer(logs_dir)?;

    tracing_subscriber::registry()
        .with(env_or(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

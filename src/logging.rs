//! Tracing setup for the `vidquery` binary.
//!
//! Events go to the systemd journal when one is reachable, otherwise to a
//! daily-rotated `vidquery.log`. Indexing runs on worker threads, so the
//! file writer is non-blocking.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives, e.g. `VIDQUERY_LOG=vidquery::index=debug`
pub const LOG_ENV: &str = "VIDQUERY_LOG";

const DEFAULT_FILTER: &str = "info";

/// Keeps the file writer flushing until the process exits
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vidquery")
        .join("logs")
}

/// Install the global subscriber. `log_dir` is only used without journald.
///
/// Fails if a subscriber is already installed.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    if let Ok(journald) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(journald)
            .try_init()?;
        tracing::debug!("Logging to journald");
        return Ok(());
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    init_file(&log_dir)
}

fn init_file(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let appender = tracing_appender::rolling::daily(log_dir, "vidquery.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()?;

    tracing::debug!(dir = %log_dir.display(), "Logging to file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir() {
        assert!(default_log_dir().ends_with("vidquery/logs"));
    }
}

//! Tracing setup.
//!
//! Logs go to a daily-rolling file under the log directory. Tool calls are
//! logged on the `mnemo::ops` target, so `MNEMO_LOG=mnemo::ops=info` gives
//! an operation log without the protocol noise.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "mnemo.log";
const DEFAULT_FILTER: &str = "info";

/// Filter precedence: `MNEMO_LOG`, `RUST_LOG`, `logging.level`, `info`.
fn build_filter(config: &LoggingConfig) -> EnvFilter {
    for var in ["MNEMO_LOG", "RUST_LOG"] {
        if let Ok(filter) = EnvFilter::try_from_env(var) {
            return filter;
        }
    }
    config
        .level
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber.
///
/// Keep the returned guard alive until exit; dropping it flushes the file
/// writer. A second call leaves the first subscriber in place.
///
/// # Errors
/// Returns an error if the log directory cannot be created.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    let stderr_layer = config
        .stderr
        .then(|| fmt::layer().with_writer(std::io::stderr).compact());

    if tracing_subscriber::registry()
        .with(build_filter(config))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(guard)
}

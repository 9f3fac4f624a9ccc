//! Logging setup for agentbus using tracing.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSettings;

const DEFAULT_FILTER: &str = "info,agentbus=debug";

/// Initialize logging with console output and, if enabled, a daily file.
///
/// The returned guard must be held for the lifetime of the process so the
/// file writer flushes.
pub fn init(settings: &LoggingSettings) -> Result<Option<(WorkerGuard, PathBuf)>> {
    let log_dir = if settings.file {
        let log_dir = get_log_dir()?;
        std::fs::create_dir_all(&log_dir)?;
        Some(log_dir)
    } else {
        None
    };

    let (subscriber, guard) = build_subscriber(settings, log_dir.as_deref());
    subscriber.init();

    match &log_dir {
        Some(dir) => tracing::debug!("Log directory: {}", dir.display()),
        None => tracing::debug!("agentbus logging initialized (console only)"),
    }

    Ok(guard.zip(log_dir))
}

/// Filter, optional file layer and console layer, not yet installed.
fn build_subscriber(
    settings: &LoggingSettings,
    log_dir: Option<&Path>,
) -> (impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>) {
    let fallback = settings.filter.as_deref().unwrap_or(DEFAULT_FILTER);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "agentbus.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    // A `None` file layer is a no-op
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer);
    (subscriber, guard)
}

/// Get the log directory path.
fn get_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "agentbus", "agentbus")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Initialize logging for tests (console only, no file). Safe to call repeatedly.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}

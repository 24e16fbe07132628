//! Structured logging.
//!
//! Every run appends JSON events to `<log_dir>/setup.log`. With `--verbose` a
//! human-readable layer also writes to stderr; without it stderr belongs to the
//! progress bars. `RUST_LOG` overrides the default level.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "setup.log";

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "demo_setup=debug,info" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file events are flushed.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_filter(filter(verbose));

    let stderr_layer = verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .with_filter(filter(verbose))
    });

    // A subscriber may already exist when embedded in tests.
    if tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already set");
    }

    tracing::info!(
        pid = std::process::id(),
        log_file = %log_dir.join(LOG_FILE_NAME).display(),
        "logging initialized"
    );
    Ok(guard)
}

/// Structured record of one step transition.
pub fn log_step_operation(session_id: &str, step: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        session_id = %session_id,
        step = %step,
        status = %status,
        details = details,
        "step operation"
    );
}

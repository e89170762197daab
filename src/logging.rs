//
// logging.rs
// Dicom-Sort-rs
//
// Tracing setup: filtered console output plus the per-object processing log file.
//

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Per-object decisions (skip reasons, failures) are written here.
pub const LOG_FILE: &str = "dicom_processing.log";
pub(crate) const FILE_FILTER: &str = "dicom_sort=info";

/// Keeps the non-blocking file writer alive; logs are flushed when it is dropped.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "dicom_sort=info" } else { "dicom_sort=warn" })
    })
}

/// Install the global subscriber. With `log_dir` set, everything at info and above from this crate
/// also goes to [`LOG_FILE`] in that directory.
pub fn init_logging(log_dir: Option<&Path>, verbose: bool) -> Result<LoggingGuard> {
    let mut layers = Vec::new();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter(verbose));
    layers.push(console_layer.boxed());

    let file_guard = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer)
                .with_filter(EnvFilter::new(FILE_FILTER));
            layers.push(file_layer.boxed());
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

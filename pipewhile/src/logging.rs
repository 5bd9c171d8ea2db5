//! Opt-in tracing subscriber installation.
//!
//! The library only emits `tracing` events. Applications that already install
//! a subscriber should leave [`RuntimeOptions::logging`](crate::RuntimeOptions)
//! unset; everyone else can let the runtime install a fmt subscriber.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::errors::{PipeError, PipeResult};

/// Keeps the non-blocking file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Filter used when `RUST_LOG` is not set, e.g. `"pipewhile=debug"`.
    pub default_filter: String,
    /// Also write events to `<dir>/<file_name>`.
    pub file: Option<LogFile>,
    /// Colored terminal output.
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_filter: "pipewhile=info".to_string(),
            file: None,
            ansi: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    pub dir: PathBuf,
    pub file_name: String,
}

/// Install the global subscriber.
///
/// Only the first call has an effect; later calls (and calls made after the
/// host application installed its own subscriber) return `Ok(())`.
pub fn init_logging(options: &LoggingOptions) -> PipeResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.default_filter))
        .map_err(|e| {
            PipeError::Config(format!(
                "invalid log filter {:?}: {}",
                options.default_filter, e
            ))
        })?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(options.ansi)
        .with_thread_names(true);

    let (file_layer, guard) = match &options.file {
        Some(file) => {
            std::fs::create_dir_all(&file.dir).map_err(|e| {
                PipeError::Config(format!(
                    "failed to create log directory {}: {}",
                    file.dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::never(&file.dir, &file.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => {
            let _ = LOG_GUARD.set(guard);
            tracing::debug!("logging initialized");
        }
        Err(_) => {
            // Someone else owns the global subscriber.
            let _ = LOG_GUARD.set(None);
        }
    }
    Ok(())
}

//! Logging initialization for RelayClaw.
//!
//! Supports three formats:
//! - `pretty`: multi-line human-readable output
//! - `component`: compact single-line output; use [`log_component!`] to add a
//!   `component` field for per-subsystem filtering
//! - `json`: structured JSON lines for log aggregators

use std::sync::Arc;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{RelayError, Result};

/// Install the global tracing subscriber from config.
///
/// `RUST_LOG` wins over `cfg.level`. A second call is a no-op, so tests and
/// embedding hosts can call it freely.
///
/// # Errors
/// Returns `RelayError::Config` if the log file cannot be opened.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let file = match &cfg.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| RelayError::Config(format!("cannot open log file {}: {}", path, e)))?;
            Some(Arc::new(file))
        }
        None => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    // try_init fails only when a subscriber is already installed.
    let _ = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => builder.json().with_writer(file).try_init(),
        (LogFormat::Json, None) => builder.json().try_init(),
        (LogFormat::Pretty, Some(file)) => builder.pretty().with_writer(file).try_init(),
        (LogFormat::Pretty, None) => builder.pretty().try_init(),
        (LogFormat::Component, Some(file)) => builder.compact().with_writer(file).try_init(),
        (LogFormat::Component, None) => builder.compact().try_init(),
    };

    Ok(())
}

/// Emit a component-tagged tracing event.
///
/// ```
/// # use relayclaw::log_component;
/// log_component!(info, "bus", "queue drained");
/// log_component!(warn, "engine", "turn slow", elapsed_ms = 8000u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}

//! Logging initialization.
//!
//! Thin wrapper over the observability crate. Logs go to
//! `~/.edge-dispatch/logs/dev.jsonl`; set `EDGE_OBS_STDERR=1` to mirror them
//! on stderr.

use crate::{CoreResult, Paths};
use observability::LogConfig;

/// Service name written into every log line.
const SERVICE_NAME: &str = "edge-dispatch";

/// Initialize tracing for the dispatcher.
///
/// `level` is used when `RUST_LOG` is not set.
pub fn init_logging(paths: &Paths, level: &str) -> CoreResult<()> {
    let also_stderr = std::env::var("EDGE_OBS_STDERR")
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    observability::init_with_config(LogConfig {
        service_name: SERVICE_NAME.into(),
        default_level: parse_level(level).as_str().to_ascii_lowercase(),
        log_path: Some(paths.log_file()),
        also_stderr,
    })?;
    Ok(())
}

/// Parse a log level string, defaulting to INFO.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

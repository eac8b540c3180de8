use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::FieldConfig;

/// Builds the default filter directive for a configured base level.
fn default_directive(level: &str) -> String {
    format!("{level},fieldlink_network={level},fieldlink_core={level},rumqttc=warn")
}

/// Initializes file + console logging under `~/.fieldlink/logs`, filtered
/// by `RUST_LOG` or else the configured level.
/// Returns a guard that must be kept alive for the duration of the process.
pub fn init_logging(config: &FieldConfig) -> Result<WorkerGuard> {
    let filter = default_directive(&config.log_level);
    install(&FieldConfig::logs_dir()?, &filter, true)
}

/// File-only logging into `logs_dir` with `filter` as the fallback directive.
/// Fails instead of panicking when a global subscriber is already set.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    install(logs_dir, filter, false)
}

fn install(logs_dir: &Path, filter: &str, console: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    // Daily rotation, one file per day.
    let file_appender = tracing_appender::rolling::daily(logs_dir, "fieldlink");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking);
    let console_layer = console.then(|| fmt::layer().with_target(false).compact());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

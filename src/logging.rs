//! Structured logging and tracing for Helios
//!
//! This module provides logging with support for structured context fields,
//! daily log rotation, and integration with the tracing ecosystem.

use crate::config::LoggingConfig;
use crate::error::{HeliosError, Result};
use std::path::Path;
use tracing::{Level, info};
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod level;
mod state;
mod structured;

pub use level::{level_rank, min_level, parse_log_level};
pub use structured::{
    ErrorThrottle, LogContext, StructuredLogger, get_logger, get_logger_with_context,
};

use state::{INIT_ERROR, INIT_ONCE, LOG_GUARD};

/// Environment variable forcing console-only logging
pub const DISABLE_FILE_LOG_ENV: &str = "HELIOS_DISABLE_FILE_LOG";

/// Initialize logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT_ONCE.call_once(|| {
        let init_result = (|| -> Result<()> {
            let base_level = parse_log_level(&config.level)?;

            // Most verbose level wins at the env filter; layers down-filter
            let console_level = config
                .console_level
                .as_ref()
                .and_then(|s| parse_log_level(s).ok())
                .unwrap_or(base_level);
            let file_level = config
                .file_level
                .as_ref()
                .and_then(|s| parse_log_level(s).ok())
                .unwrap_or(base_level);

            let filter = build_env_filter(min_level(console_level, file_level));

            if should_use_console_only() {
                init_console_only_logging(config, filter, console_level);
                return Ok(());
            }

            init_file_logging(config, filter, console_level, file_level)
        })();

        if let Err(e) = init_result {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });

    if let Some(err) = INIT_ERROR.get() {
        return Err(HeliosError::config(err.clone()));
    }
    Ok(())
}

fn build_env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("helios={},tokio_modbus=warn", level).into())
}

fn should_use_console_only() -> bool {
    cfg!(test) || std::env::var_os(DISABLE_FILE_LOG_ENV).is_some()
}

/// One fmt layer; `simple` drops span context, JSON wins over both
fn fmt_layer<S, W>(
    writer: W,
    ansi: bool,
    config: &LoggingConfig,
    level: Level,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false);
    let filter = LevelFilter::from_level(level);
    if config.json_format {
        base.json().with_filter(filter).boxed()
    } else if config.format.eq_ignore_ascii_case("simple") {
        base.compact().with_filter(filter).boxed()
    } else {
        base.with_filter(filter).boxed()
    }
}

fn init_console_only_logging(config: &LoggingConfig, filter: EnvFilter, console_level: Level) {
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(std::io::stdout, true, config, console_level))
        .try_init();

    info!("Logging to console only at {:?}", console_level);
}

/// Directory for the rolling appender; a path with an extension names a file
fn log_directory(file: &str) -> &Path {
    let path = Path::new(file);
    match path.parent() {
        Some(parent) if path.extension().is_some() => parent,
        _ => path,
    }
}

fn init_file_logging(
    config: &LoggingConfig,
    filter: EnvFilter,
    console_level: Level,
    file_level: Level,
) -> Result<()> {
    let appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("helios")
        .filename_suffix("log")
        .max_log_files(config.backup_count.max(1) as usize)
        .build(log_directory(&config.file))
        .map_err(|e| HeliosError::io(format!("Failed to create log file appender: {}", e)))?;

    let (writer, guard) = non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(writer, false, config, file_level));
    let init = if config.console_output {
        subscriber
            .with(fmt_layer(std::io::stdout, true, config, console_level))
            .try_init()
    } else {
        subscriber.try_init()
    };
    init.map_err(|e| HeliosError::config(format!("Failed to install subscriber: {}", e)))?;

    info!(
        "Logging to {} at {:?} (console {:?})",
        config.file, file_level, console_level
    );
    Ok(())
}

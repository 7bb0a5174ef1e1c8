//! Tracing bootstrap for the binary

use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber: stdout always, plus a file when configured.
///
/// `RUST_LOG` overrides the configured level.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log level '{}'", config.log_level))?;

    let file_appender = if config.log_to_file {
        let file = std::fs::File::create(&config.log_file_path)
            .with_context(|| format!("cannot create log file {}", config.log_file_path))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    let stdout_appender = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_appender)
        .with(stdout_appender)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(())
}

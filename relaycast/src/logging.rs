use std::fs::{File, OpenOptions};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Initialize structured logging
///
/// `RUST_LOG` wins over the configured level. JSON output is meant for
/// production, pretty output for development; either goes to stdout or, when
/// `file_path` is set, is appended to that file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);
    let file = config.file_path.as_deref().map(open_log_file).transpose()?;

    if config.format == "json" {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true);
        match file {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match file {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(file))
}

pub fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

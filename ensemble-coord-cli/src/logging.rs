//! Tracing setup for the binary

use crate::config::{LogFormat, LoggingConfig};
use crate::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_NAME: &str = "ensemble-coord.log";

/// Filter directive for our own crates at `level`
pub fn default_directive(level: &str) -> String {
    format!(
        "ensemble_coord_core={level},ensemble_coord_storage={level},ensemble_coord_cli={level},ensemble_coord={level}"
    )
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level. The returned guard must live until exit so buffered file output
/// is flushed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.level)))
    };

    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter())
            .boxed(),
    };

    let (file_layer, guard) = match config.log_dir() {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter())
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_covers_every_crate() {
        let directive = default_directive("debug");
        assert!(directive.contains("ensemble_coord_core=debug"));
        assert!(directive.contains("ensemble_coord_storage=debug"));
        assert!(EnvFilter::try_new(directive).is_ok());
    }
}

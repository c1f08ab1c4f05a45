//! Subscriber setup: console output plus optional rolling JSON files

use std::io;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the non-blocking file writer alive; hold it until exit
pub struct LogGuard {
    file: Option<WorkerGuard>,
}

impl LogGuard {
    /// Whether a file writer is attached
    pub fn has_file_output(&self) -> bool {
        self.file.is_some()
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::directives`]. Fails if a
/// global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .map_err(|e| ObservabilityError::Config(format!("invalid filter directives: {}", e)))?;

    let mut layers = vec![console_layer(config)];
    let mut guard = None;

    if let Some(file_config) = &config.file {
        let (writer, worker) = create_file_writer(file_config)?;
        layers.push(file_layer(config, writer));
        guard = Some(worker);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| ObservabilityError::LoggingInit(e.to_string()))?;

    Ok(LogGuard { file: guard })
}

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    let layer = fmt::layer()
        .with_writer(io::stdout)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    match config.format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn file_layer(config: &LoggingConfig, writer: NonBlocking) -> BoxedLayer {
    fmt::layer()
        .with_writer(writer)
        .with_target(config.include_target)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_ansi(false)
        .json()
        .boxed()
}

fn create_file_writer(config: &FileLoggingConfig) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.directory)?;

    let appender = match config.rotation {
        RotationStrategy::Daily => {
            tracing_appender::rolling::daily(&config.directory, &config.prefix)
        }
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => {
            tracing_appender::rolling::never(&config.directory, &config.prefix)
        }
    };

    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("logs");
        let config = FileLoggingConfig {
            directory: target.clone(),
            prefix: "portal-test".to_string(),
            rotation: RotationStrategy::Never,
        };

        let (_writer, _guard) = create_file_writer(&config).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_init_writes_json_file_and_rejects_second_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            format: LogFormat::Compact,
            file: Some(FileLoggingConfig {
                directory: dir.path().to_path_buf(),
                prefix: "portal".to_string(),
                rotation: RotationStrategy::Never,
            }),
            ..Default::default()
        };

        let guard = init_logging(&config).unwrap();
        assert!(guard.has_file_output());
        tracing::info!(target: "portal_relay", interface = "veilnet", "hello");
        drop(guard);

        let written = std::fs::read_to_string(dir.path().join("portal")).unwrap();
        assert!(written.contains("\"interface\":\"veilnet\""));

        assert!(matches!(
            init_logging(&LoggingConfig::default()),
            Err(ObservabilityError::LoggingInit(_))
        ));
    }
}

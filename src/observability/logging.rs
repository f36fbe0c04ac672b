use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the logging system with console output and a daily JSON log file.
///
/// The returned guard flushes the file writer when dropped; keep it alive for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stdout);

    let (file_layer, guard) = if config.file_enabled {
        let _ = fs::create_dir_all(&config.directory);
        let file_appender =
            tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
        (
            Some(fmt::layer().json().with_writer(non_blocking_writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    // try_init so a second call (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_and_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LoggingConfig::default();
        config.directory = dir.path().join("logs").to_string_lossy().into_owned();

        config.file_enabled = false;
        assert!(init_logging(&config).is_none());

        config.file_enabled = true;
        assert!(init_logging(&config).is_some());
        assert!(dir.path().join("logs").is_dir());
    }
}

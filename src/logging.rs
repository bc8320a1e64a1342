use crate::config::LoggingConfig;
use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level {level:?}: {source}")]
    Filter {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to open log file: {0}")]
    File(#[from] std::io::Error),

    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// `RUST_LOG` wins over the configured level when set.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
        level: level.to_string(),
        source,
    })
}

fn open_log_file(config: &LoggingConfig) -> Result<Option<File>, LoggingError> {
    let Some(path) = &config.file else {
        return Ok(None);
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Some(OpenOptions::new().create(true).append(true).open(path)?))
}

/// Install the global subscriber: stderr always, plus the log file when one
/// is configured. Call once, before anything else logs.
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config.level)?;
    let file = open_log_file(config)?;

    let stderr = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let file_layer = file.map(|file| {
        if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed()
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_rejects_garbage() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_filter("info").is_ok());
        assert!(build_filter("feedrelay=debug,warn").is_ok());
        assert!(matches!(
            build_filter("feedrelay=loud"),
            Err(LoggingError::Filter { .. })
        ));
    }

    #[test]
    fn test_log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("relay.log");
        let config = LoggingConfig {
            file: Some(path.clone()),
            ..LoggingConfig::default()
        };
        assert!(open_log_file(&config).unwrap().is_some());
        assert!(path.exists());

        assert!(open_log_file(&LoggingConfig::default()).unwrap().is_none());
    }
}

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, ServiceError};

pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = Registry::default().with(env_filter);

    if let Some(file_path) = &config.file_path {
        let open_file = || {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)
                .map_err(|e| ServiceError::Configuration(format!("failed to open log file: {}", e)))
        };

        match config.format.as_str() {
            "json" => registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
                .with(tracing_subscriber::fmt::layer().json().with_writer(open_file()?))
                .init(),
            "pretty" => registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .with(tracing_subscriber::fmt::layer().json().with_writer(open_file()?))
                .init(),
            _ => registry
                .with(tracing_subscriber::fmt::layer().compact())
                .with(tracing_subscriber::fmt::layer().json().with_writer(open_file()?))
                .init(),
        }
    } else {
        match config.format.as_str() {
            "json" => registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
                .init(),
            "pretty" => registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .init(),
            _ => registry
                .with(tracing_subscriber::fmt::layer().compact())
                .init(),
        }
    }

    info!(level = %config.level, format = %config.format, "Logging initialized");
    Ok(())
}

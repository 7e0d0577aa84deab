//! Tracing subscriber setup for the binary.

use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber: console output in the configured format,
/// filtered by `RUST_LOG` when set, otherwise by the configured level and
/// directives.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TracingError> {
    let layer: BoxedLayer = match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        (LogFormat::Pretty, false) => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .without_time()
            .boxed(),
        (LogFormat::Compact, true) => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .boxed(),
        (LogFormat::Compact, false) => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .without_time()
            .boxed(),
        (LogFormat::Json, true) => tracing_subscriber::fmt::layer()
            .json()
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .with_current_span(true)
            .boxed(),
        (LogFormat::Json, false) => tracing_subscriber::fmt::layer()
            .json()
            .with_file(config.file_line)
            .with_line_number(config.file_line)
            .with_current_span(true)
            .without_time()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(build_env_filter(config))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))
}

fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let directives = filter_directives(config, std::env::var("RUST_LOG").ok());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// `RUST_LOG` wins over the file; otherwise the level plus any configured
/// directives, with noisy dependencies quieted by default.
fn filter_directives(config: &LoggingConfig, rust_log: Option<String>) -> String {
    let base_level = config.level.as_str();
    match (rust_log, &config.filter) {
        (Some(env_filter), _) => env_filter,
        (None, Some(filter)) => format!("{},{}", base_level, filter),
        (None, None) => format!("{},sqlx=warn", base_level),
    }
}

/// Tracing initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

use serde::{Deserialize, Serialize};

/// `[observability]`: log output and the Prometheus endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// `RUST_LOG`, when set, replaces `level` and `filter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Off when the log collector adds its own.
    #[serde(default = "default_true")]
    pub timestamps: bool,

    #[serde(default)]
    pub file_line: bool,

    /// Extra directives appended after the level, e.g.
    /// `history_compactor::compaction=debug`.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            timestamps: true,
            file_line: false,
            filter: None,
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive form, as understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// When enabled, a Prometheus scrape endpoint is served on `listen_address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Off unless asked for; a follower has nothing to report.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Buckets for `workflow_history_compaction_cycle_duration_seconds`.
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets_secs: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: default_listen_address(),
            duration_buckets_secs: default_duration_buckets(),
        }
    }
}

impl MetricsConfig {
    pub fn validate(&self) -> Result<(), super::ConfigError> {
        if self.enabled && self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(super::ConfigError::Validation(format!(
                "observability.metrics.listen_address '{}' is not a socket address",
                self.listen_address
            )));
        }
        Ok(())
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:9464".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]
}

fn default_true() -> bool {
    true
}

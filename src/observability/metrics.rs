//! Prometheus metrics for compaction.
//!
//! Every recording function is a no-op unless the `prometheus` feature is
//! enabled and [`init_metrics`] installed the exporter.

#[cfg(feature = "prometheus")]
use metrics::{counter, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsConfig;

/// Install the Prometheus recorder and its scrape endpoint.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }

    let addr: std::net::SocketAddr = config
        .listen_address
        .parse()
        .map_err(|e| MetricsError::Setup(format!("invalid listen address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
            &config.duration_buckets_secs,
        )
        .map_err(|e| MetricsError::Setup(e.to_string()))?
        .install()?;

    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

/// Initialize the metrics system (no-op without prometheus feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if config.enabled {
        tracing::warn!(
            "Metrics are enabled in config but the 'prometheus' feature is not compiled"
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Metric Recording Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Record the outcome of pruning (or previewing) one workflow.
pub fn record_compaction_prune(seen: u64, deleted: u64, dry_run: bool) {
    #[cfg(feature = "prometheus")]
    {
        let mode = if dry_run { "dry_run" } else { "delete" };
        counter!("workflow_history_compaction_seen_total", "mode" => mode).increment(seen);
        counter!("workflow_history_compaction_deletions_total", "mode" => mode).increment(deleted);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (seen, deleted, dry_run);
    }
}

/// Record a failed storage call during compaction.
///
/// # Arguments
/// * `stage` - `"list"` for owner enumeration, `"prune"` for a single workflow
pub fn record_compaction_error(stage: &'static str) {
    #[cfg(feature = "prometheus")]
    {
        counter!("workflow_history_compaction_errors_total", "stage" => stage).increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = stage;
    }
}

/// Record a throttle pause.
pub fn record_compaction_throttle() {
    #[cfg(feature = "prometheus")]
    {
        counter!("workflow_history_compaction_throttle_pauses_total").increment(1);
    }
}

/// Record how long one cycle took.
pub fn record_compaction_cycle(duration_secs: f64, interrupted: bool) {
    #[cfg(feature = "prometheus")]
    {
        let outcome = if interrupted { "interrupted" } else { "completed" };
        histogram!("workflow_history_compaction_cycle_duration_seconds", "outcome" => outcome)
            .record(duration_secs);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (duration_secs, interrupted);
    }
}

/// Metrics initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to set up metrics: {0}")]
    Setup(String),

    #[cfg(feature = "prometheus")]
    #[error("Failed to install metrics recorder: {0}")]
    Install(#[from] metrics_exporter_prometheus::BuildError),
}

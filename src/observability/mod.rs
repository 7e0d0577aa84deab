//! Observability: structured logging setup and Prometheus metrics.

pub mod metrics;
#[cfg(feature = "server")]
mod tracing_init;

#[cfg(feature = "server")]
pub use tracing_init::*;

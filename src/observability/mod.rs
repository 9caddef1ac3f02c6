//! # Observability Infrastructure
//!
//! Structured logging and Prometheus metrics for the sidecar.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;

/// Initialize logging and the metrics exporter in one go.
pub fn init_observability(config: &ObservabilityConfig) -> Result<MetricsRecorder> {
    init_logging(config)?;
    init_metrics(config)
}

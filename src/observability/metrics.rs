//! # Metrics Collection
//!
//! Provides Prometheus metrics collection for the sidecar: per-resource
//! retrieval counters, a lease-expiry gauge, and token-maintenance counters,
//! exposed over HTTP at `/metrics` on a configurable port.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Metrics recorder that tracks retrieval and token activity.
///
/// The struct is stateless: every method forwards to the globally installed
/// exporter, so recorders are freely cloneable and a recorder used before
/// [`init_metrics`] ran is a no-op.
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record an attempted retrieval or renewal for a resource
    pub fn resource_total(&self, resource_id: &str) {
        let labels = [("resource_id", resource_id.to_string())];
        counter!("resource_total_counter", &labels).increment(1);
    }

    /// Record a successful retrieval or renewal for a resource
    pub fn resource_success(&self, resource_id: &str) {
        let labels = [("resource_id", resource_id.to_string())];
        counter!("resource_success_counter", &labels).increment(1);
    }

    /// Record a failed retrieval or renewal for a resource
    pub fn resource_error(&self, resource_id: &str) {
        let labels = [("resource_id", resource_id.to_string())];
        counter!("resource_error_counter", &labels).increment(1);
    }

    /// Update the seconds-until-expiry gauge for a resource
    pub fn resource_expiry(&self, resource_id: &str, seconds_remaining: f64) {
        let labels = [("resource_id", resource_id.to_string())];
        gauge!("resource_expiry_gauge", &labels).set(seconds_remaining);
    }

    /// Record an attempted token renewal
    pub fn token_total(&self) {
        counter!("token_total_counter").increment(1);
    }

    /// Record a successful token renewal
    pub fn token_success(&self) {
        counter!("token_success_counter").increment(1);
    }

    /// Record a failed token renewal
    pub fn token_error(&self) {
        counter!("token_error_counter").increment(1);
    }

    /// Record a generic, non-resource error by reason
    pub fn error(&self, reason: &str) {
        let labels = [("reason", reason.to_string())];
        counter!("error_counter", &labels).increment(1);
    }

    /// Register series so the export is populated before any event occurs.
    pub fn register_metrics(&self) {
        describe_gauge!(
            "resource_expiry_gauge",
            Unit::Seconds,
            "Seconds until the current lease of a resource expires"
        );
        describe_counter!(
            "resource_total_counter",
            Unit::Count,
            "Retrieval and renewal attempts per resource"
        );
        describe_counter!(
            "resource_success_counter",
            Unit::Count,
            "Successful retrievals and renewals per resource"
        );
        describe_counter!(
            "resource_error_counter",
            Unit::Count,
            "Failed retrievals and renewals per resource"
        );
        describe_counter!("token_total_counter", Unit::Count, "Token renewal attempts");
        describe_counter!("token_success_counter", Unit::Count, "Successful token renewals");
        describe_counter!("token_error_counter", Unit::Count, "Failed token renewals");
        describe_counter!("error_counter", Unit::Count, "Generic errors grouped by reason");

        counter!("token_total_counter").absolute(0);
        counter!("token_success_counter").absolute(0);
        counter!("token_error_counter").absolute(0);
    }
}

/// Initialize metrics collection and the Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<MetricsRecorder> {
    let recorder = MetricsRecorder::new();

    if !config.enable_metrics {
        return Ok(recorder);
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("metrics disabled: no bind address configured");
            return Ok(recorder);
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    recorder.register_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(recorder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_without_exporter_is_a_noop() {
        let recorder = MetricsRecorder::new();
        recorder.resource_total("secret/db");
        recorder.resource_success("secret/db");
        recorder.resource_error("secret/db");
        recorder.resource_expiry("secret/db", 3600.0);
        recorder.token_total();
        recorder.token_success();
        recorder.token_error();
        recorder.error("revoke");
    }

    #[test]
    fn test_init_metrics_disabled() {
        let config = ObservabilityConfig { enable_metrics: false, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_init_metrics_no_port() {
        let config =
            ObservabilityConfig { enable_metrics: true, metrics_port: 0, ..Default::default() };
        assert!(init_metrics(&config).is_ok());
    }
}

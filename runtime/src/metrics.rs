//! Prometheus metrics for ordered event processing.
//!
//! Processors and hosts record through the `metrics` facade unconditionally;
//! the values are only exported once a recorder is installed, for instance by
//! [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use event_serializer_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use event_serializer_core::handoff::RetireReason;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the scrape endpoint is advertised on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning
    /// and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "serializer_events_received_total",
        "Deliveries received by processor generations, duplicates included"
    );
    describe_counter!(
        "serializer_events_applied_total",
        "Events handed to the apply operation"
    );
    describe_counter!(
        "serializer_duplicates_total",
        "Deliveries discarded as already applied or already buffered"
    );
    describe_counter!(
        "serializer_out_of_order_total",
        "Deliveries buffered behind a gap"
    );
    describe_counter!(
        "serializer_apply_failures_total",
        "Events whose apply operation failed and were advanced past"
    );
    describe_counter!(
        "serializer_apply_retries_total",
        "Retried apply calls"
    );
    describe_counter!(
        "serializer_drain_swept_total",
        "Deliveries recovered by the drain sweep after input closed"
    );
    describe_counter!(
        "serializer_generations_started_total",
        "Processor generations started"
    );
    describe_counter!(
        "serializer_handoffs_total",
        "Processor generations retired, labelled by reason"
    );
    describe_gauge!(
        "serializer_pending_events",
        "Events buffered by the most recently active generation"
    );
    describe_histogram!(
        "serializer_apply_duration_seconds",
        "Time spent in the apply operation, retries included"
    );
}

/// Processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record a delivery.
    pub fn record_received() {
        counter!("serializer_events_received_total").increment(1);
    }

    /// Record a discarded duplicate.
    pub fn record_duplicate() {
        counter!("serializer_duplicates_total").increment(1);
    }

    /// Record an out-of-order delivery.
    pub fn record_out_of_order() {
        counter!("serializer_out_of_order_total").increment(1);
    }

    /// Record a completed apply call.
    pub fn record_apply(duration: Duration) {
        counter!("serializer_events_applied_total").increment(1);
        histogram!("serializer_apply_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an apply failure that was advanced past.
    pub fn record_apply_failure() {
        counter!("serializer_apply_failures_total").increment(1);
    }

    /// Record retried apply calls.
    pub fn record_retries(count: u64) {
        counter!("serializer_apply_retries_total").increment(count);
    }

    /// Record deliveries recovered by the drain sweep.
    pub fn record_swept(count: u64) {
        counter!("serializer_drain_swept_total").increment(count);
    }

    /// Record the number of buffered events.
    pub fn record_pending(pending: usize) {
        // Precision loss acceptable for a gauge
        #[allow(clippy::cast_precision_loss)]
        gauge!("serializer_pending_events").set(pending as f64);
    }
}

/// Generation lifecycle metrics recorder.
pub struct GenerationMetrics;

impl GenerationMetrics {
    /// Record a generation start.
    pub fn record_started() {
        counter!("serializer_generations_started_total").increment(1);
    }

    /// Record a generation handoff.
    pub fn record_handoff(reason: RetireReason) {
        counter!("serializer_handoffs_total", "reason" => reason.as_str()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ProcessorMetrics::record_received();
        ProcessorMetrics::record_apply(Duration::from_millis(3));
        GenerationMetrics::record_handoff(RetireReason::GenerationTimer);

        // handle is None if another test installed the recorder first
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("serializer_events_received_total"));
            assert!(rendered.contains("serializer_events_applied_total"));
            assert!(rendered.contains("generation_timer"));
        }
    }
}

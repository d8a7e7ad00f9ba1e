//! # Metrics Collection Module
//!
//! Prometheus metrics for the event pipeline. This is the export surface for
//! operators; the analytic performance monitor keeps its own sample store.

use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    histogram_opts, opts, register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Gauge,
    Histogram, IntCounter, IntGauge, Registry, TextEncoder,
};

use crate::error::{PipelineError, Result};

/// Metrics collector for the event pipeline
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,

    // Event metrics
    pub events_ingested_total: IntCounter,
    pub events_processed_total: IntCounter,
    pub events_failed_total: IntCounter,
    pub events_deduplicated_total: IntCounter,
    pub events_conflated_total: IntCounter,
    pub events_dead_letter_total: IntCounter,
    pub events_shed_total: IntCounter,
    pub notifications_dispatched_total: IntCounter,

    // Queue metrics
    pub queue_depth: IntGauge,
    pub queue_rejections_total: IntCounter,

    // Dispatch metrics
    pub dispatch_duration_seconds: Histogram,
    pub end_to_end_latency_seconds: Histogram,

    // Error metrics
    pub errors_recorded_total: IntCounter,

    // Capacity metrics
    pub processing_units: IntGauge,
    pub concurrency_level: IntGauge,
    pub cpu_utilization: Gauge,
    pub memory_utilization: Gauge,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_ingested_total = register_int_counter_with_registry!(
            opts!("events_ingested_total", "Events accepted from adapters"),
            &registry
        )
        .map_err(register_error)?;

        let events_processed_total = register_int_counter_with_registry!(
            opts!("events_processed_total", "Events dispatched successfully"),
            &registry
        )
        .map_err(register_error)?;

        let events_failed_total = register_int_counter_with_registry!(
            opts!("events_failed_total", "Events that failed dispatch"),
            &registry
        )
        .map_err(register_error)?;

        let events_deduplicated_total = register_int_counter_with_registry!(
            opts!("events_deduplicated_total", "Events dropped as duplicates"),
            &registry
        )
        .map_err(register_error)?;

        let events_conflated_total = register_int_counter_with_registry!(
            opts!("events_conflated_total", "Events replaced in place by conflation"),
            &registry
        )
        .map_err(register_error)?;

        let events_dead_letter_total = register_int_counter_with_registry!(
            opts!("events_dead_letter_total", "Events moved to the dead-letter topic"),
            &registry
        )
        .map_err(register_error)?;

        let events_shed_total = register_int_counter_with_registry!(
            opts!("events_shed_total", "Events rejected by the priority floor"),
            &registry
        )
        .map_err(register_error)?;

        let notifications_dispatched_total = register_int_counter_with_registry!(
            opts!(
                "notifications_dispatched_total",
                "Synthesized notification events dispatched directly"
            ),
            &registry
        )
        .map_err(register_error)?;

        let queue_depth = register_int_gauge_with_registry!(
            opts!("queue_depth", "Total queued events across topics"),
            &registry
        )
        .map_err(register_error)?;

        let queue_rejections_total = register_int_counter_with_registry!(
            opts!("queue_rejections_total", "Enqueues rejected by full topics"),
            &registry
        )
        .map_err(register_error)?;

        let dispatch_duration_seconds = register_histogram_with_registry!(
            histogram_opts!(
                "dispatch_duration_seconds",
                "Time spent dispatching one event to its handlers",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &registry
        )
        .map_err(register_error)?;

        let end_to_end_latency_seconds = register_histogram_with_registry!(
            histogram_opts!(
                "end_to_end_latency_seconds",
                "Latency from adapter intake to dispatch completion",
                vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            ),
            &registry
        )
        .map_err(register_error)?;

        let errors_recorded_total = register_int_counter_with_registry!(
            opts!("errors_recorded_total", "Errors recorded in the ledger"),
            &registry
        )
        .map_err(register_error)?;

        let processing_units = register_int_gauge_with_registry!(
            opts!("processing_units", "Currently allocated processing units"),
            &registry
        )
        .map_err(register_error)?;

        let concurrency_level = register_int_gauge_with_registry!(
            opts!("concurrency_level", "Concurrency applied to the queue manager"),
            &registry
        )
        .map_err(register_error)?;

        let cpu_utilization = register_gauge_with_registry!(
            opts!("cpu_utilization", "Sampled CPU utilization percentage"),
            &registry
        )
        .map_err(register_error)?;

        let memory_utilization = register_gauge_with_registry!(
            opts!("memory_utilization", "Sampled memory utilization percentage"),
            &registry
        )
        .map_err(register_error)?;

        Ok(Self {
            registry: Arc::new(registry),
            events_ingested_total,
            events_processed_total,
            events_failed_total,
            events_deduplicated_total,
            events_conflated_total,
            events_dead_letter_total,
            events_shed_total,
            notifications_dispatched_total,
            queue_depth,
            queue_rejections_total,
            dispatch_duration_seconds,
            end_to_end_latency_seconds,
            errors_recorded_total,
            processing_units,
            concurrency_level,
            cpu_utilization,
            memory_utilization,
        })
    }

    pub fn observe_dispatch(&self, elapsed: Duration, ok: bool) {
        self.dispatch_duration_seconds.observe(elapsed.as_secs_f64());
        if ok {
            self.events_processed_total.inc();
        } else {
            self.events_failed_total.inc();
        }
    }

    pub fn observe_end_to_end(&self, elapsed: Duration) {
        self.end_to_end_latency_seconds.observe(elapsed.as_secs_f64());
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PipelineError::system(format!("failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| PipelineError::system(format!("metrics are not valid UTF-8: {e}")))
    }
}

fn register_error(err: prometheus::Error) -> PipelineError {
    PipelineError::system(format!("failed to register metric: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_registers_and_exports() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.events_ingested_total.inc();
        metrics.observe_dispatch(Duration::from_millis(12), true);
        metrics.observe_end_to_end(Duration::from_millis(40));

        let text = metrics.export().unwrap();
        assert!(text.contains("events_ingested_total 1"));
        assert!(text.contains("events_processed_total 1"));
        assert!(text.contains("dispatch_duration_seconds"));
    }

    #[test]
    fn test_failed_dispatch_counted() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.observe_dispatch(Duration::from_millis(5), false);
        assert_eq!(metrics.events_failed_total.get(), 1);
        assert_eq!(metrics.events_processed_total.get(), 0);
    }
}

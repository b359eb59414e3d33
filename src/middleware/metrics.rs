//! Prometheus metrics for the deletion workflow.
//!
//! Each recorder owns its own `Registry` so several coordinators (tests,
//! CLI commands) can coexist in one process. The `/metrics` handler renders
//! the registry in text exposition format.

use std::time::Duration;

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, Registry, TextEncoder,
};

use crate::models::deletion::DeletionState;

pub struct DeletionMetrics {
    registry: Registry,
    requests_total: CounterVec,
    confirmations_total: CounterVec,
    transitions_total: CounterVec,
    erase_failures_total: CounterVec,
    store_seconds: HistogramVec,
}

impl DeletionMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            opts!("deletion_requests_total", "Deletion request create calls by outcome"),
            &["outcome"],
        )?;
        let confirmations_total = CounterVec::new(
            opts!(
                "deletion_confirmations_total",
                "Confirmation code submissions by outcome"
            ),
            &["outcome"],
        )?;
        let transitions_total = CounterVec::new(
            opts!("deletion_transitions_total", "Request state transitions"),
            &["to"],
        )?;
        let erase_failures_total = CounterVec::new(
            opts!(
                "deletion_erase_failures_total",
                "Destructive actions that failed after all attempts"
            ),
            &["resource_kind"],
        )?;
        let store_seconds = HistogramVec::new(
            histogram_opts!(
                "deletion_store_seconds",
                "Latency of store operations in seconds",
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
            ),
            &["op"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(confirmations_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(erase_failures_total.clone()))?;
        registry.register(Box::new(store_seconds.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            confirmations_total,
            transitions_total,
            erase_failures_total,
            store_seconds,
        })
    }

    pub fn request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn confirmation(&self, outcome: &str) {
        self.confirmations_total.with_label_values(&[outcome]).inc();
    }

    pub fn transition(&self, to: DeletionState) {
        self.transitions_total.with_label_values(&[to.as_str()]).inc();
    }

    pub fn transitions(&self, to: DeletionState, count: usize) {
        self.transitions_total
            .with_label_values(&[to.as_str()])
            .inc_by(count as f64);
    }

    pub fn erase_failure(&self, resource_kind: &str) {
        self.erase_failures_total
            .with_label_values(&[resource_kind])
            .inc();
    }

    pub fn store_latency(&self, op: &str, elapsed: Duration) {
        self.store_seconds
            .with_label_values(&[op])
            .observe(elapsed.as_secs_f64());
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

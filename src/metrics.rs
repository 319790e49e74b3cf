//! Metrics collector contract. Only the trait and a no-op default live in
//! the core; a Prometheus/statsd backend is an application concern.

use std::collections::HashMap;

pub trait MetricsCollector: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64, labels: &HashMap<String, String>);
    fn set_gauge(&self, name: &str, value: f64, labels: &HashMap<String, String>);
}

/// Discards everything. The default for clients that don't care to wire up
/// a metrics backend.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn increment_counter(&self, _name: &str, _value: u64, _labels: &HashMap<String, String>) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &HashMap<String, String>) {}
}

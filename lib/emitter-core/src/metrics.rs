//! Route emitter metrics

use crate::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Receiver of the counters the event handler reports
pub trait MetricsSink: Send + Sync {
    fn routes_registered(&self, count: usize);
    fn routes_unregistered(&self, count: usize);
    /// A full re-announcement of `count` routes
    fn routes_synced(&self, count: usize);
    fn routes_total(&self, count: usize);
    fn http_route_count(&self, count: usize);
    fn tcp_route_count(&self, count: usize);
}

/// Sink that drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn routes_registered(&self, _count: usize) {}
    fn routes_unregistered(&self, _count: usize) {}
    fn routes_synced(&self, _count: usize) {}
    fn routes_total(&self, _count: usize) {}
    fn http_route_count(&self, _count: usize) {}
    fn tcp_route_count(&self, _count: usize) {}
}

/// Prometheus-backed sink with its own registry
#[derive(Clone)]
pub struct PrometheusMetrics {
    /// Routes registered with the router fleet
    pub routes_registered_total: IntCounter,
    /// Routes unregistered from the router fleet
    pub routes_unregistered_total: IntCounter,
    /// Routes re-announced by periodic emits
    pub routes_synced_total: IntCounter,
    /// HTTP endpoints announced by the last emit
    pub routes_total: IntGauge,
    pub http_route_count: IntGauge,
    pub tcp_route_count: IntGauge,
    pub registry: Arc<Registry>,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let routes_registered_total = IntCounter::new(
            "routes_registered_total",
            "Total routes registered with the router fleet",
        )?;
        let routes_unregistered_total = IntCounter::new(
            "routes_unregistered_total",
            "Total routes unregistered from the router fleet",
        )?;
        let routes_synced_total = IntCounter::new(
            "routes_synced_total",
            "Total routes re-announced by periodic emits",
        )?;
        let routes_total = IntGauge::new("routes_total", "HTTP endpoints announced by the last emit")?;
        let http_route_count =
            IntGauge::new("http_route_count", "HTTP endpoints currently routed")?;
        let tcp_route_count = IntGauge::new("tcp_route_count", "TCP route mappings currently routed")?;

        registry.register(Box::new(routes_registered_total.clone()))?;
        registry.register(Box::new(routes_unregistered_total.clone()))?;
        registry.register(Box::new(routes_synced_total.clone()))?;
        registry.register(Box::new(routes_total.clone()))?;
        registry.register(Box::new(http_route_count.clone()))?;
        registry.register(Box::new(tcp_route_count.clone()))?;

        Ok(Self {
            routes_registered_total,
            routes_unregistered_total,
            routes_synced_total,
            routes_total,
            http_route_count,
            tcp_route_count,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn as_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

impl MetricsSink for PrometheusMetrics {
    fn routes_registered(&self, count: usize) {
        self.routes_registered_total.inc_by(count as u64);
    }

    fn routes_unregistered(&self, count: usize) {
        self.routes_unregistered_total.inc_by(count as u64);
    }

    fn routes_synced(&self, count: usize) {
        self.routes_synced_total.inc_by(count as u64);
    }

    fn routes_total(&self, count: usize) {
        self.routes_total.set(as_i64(count));
    }

    fn http_route_count(&self, count: usize) {
        self.http_route_count.set(as_i64(count));
    }

    fn tcp_route_count(&self, count: usize) {
        self.tcp_route_count.set(as_i64(count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PrometheusMetrics::new().expect("Failed to create metrics");
        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("# HELP routes_registered_total"));
        assert!(text.contains("# TYPE routes_total gauge"));
    }

    #[test]
    fn test_sink_updates_counters_and_gauges() {
        let metrics = PrometheusMetrics::new().expect("Failed to create metrics");
        metrics.routes_registered(3);
        metrics.routes_registered(2);
        metrics.routes_unregistered(1);
        metrics.routes_synced(4);
        metrics.routes_total(4);
        metrics.http_route_count(7);
        metrics.tcp_route_count(2);
        metrics.http_route_count(6);

        assert_eq!(metrics.routes_registered_total.get(), 5);
        assert_eq!(metrics.routes_unregistered_total.get(), 1);
        assert_eq!(metrics.routes_synced_total.get(), 4);
        assert_eq!(metrics.routes_total.get(), 4);
        assert_eq!(metrics.http_route_count.get(), 6);
        assert_eq!(metrics.tcp_route_count.get(), 2);

        let text = metrics.gather().expect("Failed to gather metrics");
        assert!(text.contains("http_route_count 6"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = PrometheusMetrics::new().expect("Failed to create metrics");
        let second = PrometheusMetrics::new().expect("Failed to create metrics");
        first.routes_registered(1);
        assert_eq!(second.routes_registered_total.get(), 0);
    }
}

//! A small `prometheus` registry tracking request counts, latency, queue
//! depth, and active workers, exposed as text at `/ccrelay/api/metrics`.
//! Trimmed from the gateway's `MetricsCollector`: no VictoriaMetrics push
//! loop and no plugin/Lua-pool gauges, since nothing in this repository
//! has a plugin runtime.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct MetricsCollector {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
    pub queue_depth: IntGaugeVec,
    pub active_workers: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("ccrelay_http_requests_total", "Total HTTP requests").namespace("ccrelay"),
            &["route", "method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("ccrelay_http_request_duration_seconds", "Request latency")
                .namespace("ccrelay")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["route"],
        )?;

        let queue_depth =
            IntGaugeVec::new(Opts::new("ccrelay_queue_depth", "Tasks waiting for a worker permit").namespace("ccrelay"), &["queue"])?;

        let active_workers =
            IntGaugeVec::new(Opts::new("ccrelay_active_workers", "Workers currently executing a request").namespace("ccrelay"), &["queue"])?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Self { registry, http_requests_total, http_request_duration, queue_depth, active_workers })
    }

    pub fn record_request(&self, route: &str, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total.with_label_values(&[route, method, &status.to_string()]).inc();
        self.http_request_duration.with_label_values(&[route]).observe(duration_secs);
    }

    pub fn set_queue_gauges(&self, queue: &str, depth: i64, active: i64) {
        self.queue_depth.with_label_values(&[queue]).set(depth);
        self.active_workers.with_label_values(&[queue]).set(active);
    }

    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}

//! Prometheus metrics for the flow collector.

use prometheus::{
    Counter, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::sync::Arc;

/// Metrics collector shared by ingestion, flushing and the daemon.
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub digests_received_total: Counter,
    pub digests_applied_total: Counter,
    pub digests_regressed_total: Counter,
    pub digests_duplicate_total: Counter,
    pub digests_malformed_total: Counter,
    pub frames_rejected_total: Counter,
    pub flows_created_total: Counter,
    pub flows_expired_total: Counter,
    pub records_flushed_total: Counter,
    pub records_dropped_total: Counter,
    pub flush_failures_total: Counter,
    pub sync_flushes_total: Counter,
    pub alerts_total: Counter,

    // Gauges
    pub active_flows: Gauge,
    pub buffer_depth: Gauge,
    pub health_status: Gauge,
    pub switch_sessions: GaugeVec,

    // Histograms
    pub flush_latency_seconds: Histogram,
    pub batch_size: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<Counter, prometheus::Error> {
            let c = Counter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let digests_received_total =
            counter("flowtel_digests_received_total", "Total digests received")?;
        let digests_applied_total = counter(
            "flowtel_digests_applied_total",
            "Digests that created or updated a flow",
        )?;
        let digests_regressed_total = counter(
            "flowtel_digests_regressed_total",
            "Digests dropped because their packet count went backwards",
        )?;
        let digests_duplicate_total = counter(
            "flowtel_digests_duplicate_total",
            "Digests dropped as exact repeats",
        )?;
        let digests_malformed_total = counter(
            "flowtel_digests_malformed_total",
            "Frames that failed to decode",
        )?;
        let frames_rejected_total = counter(
            "flowtel_frames_rejected_total",
            "Datagrams with bad framing or an unknown session token",
        )?;
        let flows_created_total = counter(
            "flowtel_flows_created_total",
            "Flow instances created, including restarts after expiry",
        )?;
        let flows_expired_total =
            counter("flowtel_flows_expired_total", "Flow instances expired")?;
        let records_flushed_total = counter(
            "flowtel_records_flushed_total",
            "Flow records written to the durable store",
        )?;
        let records_dropped_total = counter(
            "flowtel_records_dropped_total",
            "Flow records dropped because the buffer could not hold them",
        )?;
        let flush_failures_total =
            counter("flowtel_flush_failures_total", "Failed store appends")?;
        let sync_flushes_total = counter(
            "flowtel_sync_flushes_total",
            "Flushes forced by a full buffer on the ingestion path",
        )?;
        let alerts_total = counter("flowtel_alerts_total", "Flow alerts raised")?;

        // Gauges
        let active_flows = Gauge::with_opts(Opts::new(
            "flowtel_active_flows",
            "Current number of active flow instances",
        ))?;
        registry.register(Box::new(active_flows.clone()))?;

        let buffer_depth = Gauge::with_opts(Opts::new(
            "flowtel_buffer_depth",
            "Records waiting in the flush buffer",
        ))?;
        registry.register(Box::new(buffer_depth.clone()))?;

        let health_status = Gauge::with_opts(Opts::new(
            "flowtel_health_status",
            "Service health status (1.0=healthy, 0.5=degraded, 0.0=unhealthy)",
        ))?;
        registry.register(Box::new(health_status.clone()))?;

        let switch_sessions = GaugeVec::new(
            Opts::new("flowtel_switch_sessions", "Switch sessions by state"),
            &["state"],
        )?;
        registry.register(Box::new(switch_sessions.clone()))?;

        // Histograms
        let flush_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flowtel_flush_latency_seconds",
                "Store append latency in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
        )?;
        registry.register(Box::new(flush_latency_seconds.clone()))?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("flowtel_batch_size", "Records per store append").buckets(vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
            ]),
        )?;
        registry.register(Box::new(batch_size.clone()))?;

        Ok(Self {
            digests_received_total,
            digests_applied_total,
            digests_regressed_total,
            digests_duplicate_total,
            digests_malformed_total,
            frames_rejected_total,
            flows_created_total,
            flows_expired_total,
            records_flushed_total,
            records_dropped_total,
            flush_failures_total,
            sync_flushes_total,
            alerts_total,
            active_flows,
            buffer_depth,
            health_status,
            switch_sessions,
            flush_latency_seconds,
            batch_size,
            registry: Arc::new(registry),
        })
    }

    /// Record a flushed batch
    pub fn record_flush(&self, records: usize, latency_secs: f64) {
        self.records_flushed_total.inc_by(records as f64);
        self.batch_size.observe(records as f64);
        self.flush_latency_seconds.observe(latency_secs);
    }

    /// Record a failed flush
    pub fn record_flush_failure(&self) {
        self.flush_failures_total.inc();
    }

    /// Record dropped records
    pub fn record_dropped(&self, records: usize) {
        self.records_dropped_total.inc_by(records as f64);
    }

    /// Update buffer depth
    pub fn set_buffer_depth(&self, depth: usize) {
        self.buffer_depth.set(depth as f64);
    }

    /// Update active flow count
    pub fn set_active_flows(&self, count: usize) {
        self.active_flows.set(count as f64);
    }

    /// Update the session count for a state
    pub fn set_switch_sessions(&self, state: &str, count: usize) {
        self.switch_sessions
            .with_label_values(&[state])
            .set(count as f64);
    }

    /// Update health status
    pub fn set_health_status(&self, status: HealthStatus) {
        let value = match status {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.5,
            HealthStatus::Unhealthy => 0.0,
        };
        self.health_status.set(value);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

/// Health status for the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Service is fully operational
    Healthy,
    /// Service is operational but degraded
    Degraded,
    /// Service is not operational
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

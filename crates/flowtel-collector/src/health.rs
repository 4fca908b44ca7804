//! Health monitoring for the flush path.
//!
//! Health degrades when the flush buffer is saturated or store appends fail
//! too often, and becomes unhealthy when pending records stop draining.

use crate::metrics::{HealthStatus, MetricsCollector};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Health monitor for the collector
pub struct HealthMonitor {
    /// Metrics collector to update
    metrics: MetricsCollector,

    /// Last time a batch reached the store, or the buffer was empty
    last_progress: Instant,

    /// Maximum stall duration before unhealthy
    max_stall_duration: Duration,

    /// Total flush attempts
    total_flushes: u64,

    /// Failed flush attempts
    failed_flushes: u64,

    /// Maximum failure rate before degraded
    max_failure_rate: f64,

    /// Buffer at capacity
    saturated: bool,

    /// Records waiting
    pending: usize,

    /// Current health status
    current_status: HealthStatus,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        metrics: MetricsCollector,
        max_stall_duration: Duration,
        max_failure_rate: f64,
    ) -> Self {
        let status = HealthStatus::Healthy;
        metrics.set_health_status(status);

        Self {
            metrics,
            last_progress: Instant::now(),
            max_stall_duration,
            total_flushes: 0,
            failed_flushes: 0,
            max_failure_rate,
            saturated: false,
            pending: 0,
            current_status: status,
        }
    }

    /// Record a successful store append
    pub fn record_flush_success(&mut self) {
        self.last_progress = Instant::now();
        self.total_flushes += 1;
        self.update_health();
    }

    /// Record a failed store append
    pub fn record_flush_failure(&mut self) {
        self.total_flushes += 1;
        self.failed_flushes += 1;
        self.update_health();
    }

    /// Record buffer occupancy
    pub fn set_buffer_state(&mut self, pending: usize, saturated: bool) {
        if pending == 0 {
            self.last_progress = Instant::now();
        }
        self.pending = pending;
        self.saturated = saturated;
        self.update_health();
    }

    /// Current status
    pub fn status(&self) -> HealthStatus {
        self.current_status
    }

    /// Recompute and publish the status
    pub fn update_health(&mut self) {
        let new_status = self.calculate_health();

        if new_status != self.current_status {
            info!(
                old_status = %self.current_status,
                new_status = %new_status,
                "Health status changed"
            );
            self.current_status = new_status;
            self.metrics.set_health_status(new_status);
        }
    }

    fn calculate_health(&self) -> HealthStatus {
        let stalled = self.pending > 0 && self.last_progress.elapsed() > self.max_stall_duration;

        let failure_rate = if self.total_flushes > 0 {
            self.failed_flushes as f64 / self.total_flushes as f64
        } else {
            0.0
        };

        if stalled {
            warn!(
                elapsed_secs = self.last_progress.elapsed().as_secs(),
                pending = self.pending,
                "Flush path stalled"
            );
            return HealthStatus::Unhealthy;
        }

        if self.saturated || failure_rate > self.max_failure_rate {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }
}

//! Collector tuning.
//!
//! The flow timeout and alert thresholds are part of the monitoring policy
//! and are applied separately.

use crate::error::{CollectorError, Result};
use std::time::Duration;

/// Runtime settings for the digest consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Records per store append.
    pub batch_size: usize,
    /// Maximum records resident in the flush buffer.
    pub buffer_capacity: usize,
    /// Time-based flush trigger.
    pub flush_interval: Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
    /// How long expired instances are kept before being purged.
    pub tombstone_retention: Duration,
    /// Recent alerts kept for queries.
    pub alert_history: usize,
    /// Capacity of per-session ingestion channels.
    pub ingest_channel_capacity: usize,
    /// Flush stall after which the collector reports unhealthy.
    pub max_flush_stall: Duration,
    /// Failed flush ratio above which the collector reports degraded.
    pub max_flush_failure_rate: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(10),
            tombstone_retention: Duration::from_secs(300),
            alert_history: 1_000,
            ingest_channel_capacity: 1_024,
            max_flush_stall: Duration::from_secs(60),
            max_flush_failure_rate: 0.05,
        }
    }
}

impl CollectorConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CollectorError::invalid_config("batch_size", "must be positive"));
        }
        if self.buffer_capacity < self.batch_size {
            return Err(CollectorError::invalid_config(
                "buffer_capacity",
                format!("must be at least batch_size ({})", self.batch_size),
            ));
        }
        if self.flush_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(CollectorError::invalid_config(
                "flush_interval",
                "flush and sweep intervals must be non-zero",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_flush_failure_rate) {
            return Err(CollectorError::invalid_config(
                "max_flush_failure_rate",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

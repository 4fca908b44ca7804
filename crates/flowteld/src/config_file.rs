//! Configuration file support for flowteld
//!
//! Loads and validates daemon configuration from TOML files.
//! Default location: /etc/flowtel/flowteld.toml

use crate::error::{DaemonError, Result};
use flowtel_collector::CollectorConfig;
use flowtel_common::PolicyConfig;
use flowtel_dataplane::{PipelineConfig, TableKind};
use flowtel_rulemgr::{BackoffPolicy, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/flowtel/flowteld.toml";

/// Digest consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorSection {
    /// Records per store append
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum records held in the flush buffer
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Expiry sweep period in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds an expired flow is kept before it is purged
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_secs: u64,

    /// Recent alerts kept for the API
    #[serde(default = "default_alert_history")]
    pub alert_history: usize,

    /// Per-session ingestion channel depth
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,

    /// Directory for `flows.jsonl` and `switches.jsonl`; in-memory stores
    /// when unset
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

/// Flow rule manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSection {
    /// Timeout of each request to a switch in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Policy reconciliation period in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Heartbeat probe period in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before a switch is disconnected
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Attempts per request, including the first
    #[serde(default = "default_backoff_attempts")]
    pub backoff_max_attempts: u32,
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// HTTP API and metrics listen address
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// UDP digest listen address
    #[serde(default = "default_digest_listen")]
    pub digest_listen: String,
}

/// Data plane configuration for simulated switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataplaneSection {
    /// Flow state table slots per switch
    #[serde(default = "default_flow_table_capacity")]
    pub flow_table_capacity: u32,

    /// Flow state table layout
    #[serde(default)]
    pub table: TableKind,

    /// Traffic generator tick in milliseconds
    #[serde(default = "default_sim_tick")]
    pub sim_tick_ms: u64,

    /// Upper bound on packets injected per flow burst
    #[serde(default = "default_sim_burst")]
    pub sim_max_burst: u32,
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    /// Maximum flush stall in seconds before considering unhealthy
    #[serde(default = "default_max_stall_seconds")]
    pub max_stall_secs: u64,

    /// Failed flush ratio (0.0 to 1.0) before degraded
    #[serde(default = "default_max_flush_failure_rate")]
    pub max_flush_failure_rate: f64,
}

/// Complete flowteld configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowtelConfig {
    #[serde(default)]
    pub collector: CollectorSection,

    #[serde(default)]
    pub manager: ManagerSection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub dataplane: DataplaneSection,

    /// Initial monitoring policy
    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub health: HealthSection,
}

// Default functions
fn default_batch_size() -> usize {
    100
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_tombstone_retention() -> u64 {
    300
}

fn default_alert_history() -> usize {
    1_000
}

fn default_ingest_channel_capacity() -> usize {
    1_024
}

fn default_request_timeout() -> u64 {
    5_000
}

fn default_reconcile_interval() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    5_000
}

fn default_backoff_attempts() -> u32 {
    5
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_digest_listen() -> String {
    "0.0.0.0:9555".to_string()
}

fn default_flow_table_capacity() -> u32 {
    65_536
}

fn default_sim_tick() -> u64 {
    100
}

fn default_sim_burst() -> u32 {
    50
}

fn default_max_stall_seconds() -> u64 {
    60
}

fn default_max_flush_failure_rate() -> f64 {
    0.05
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            buffer_capacity: default_buffer_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            tombstone_retention_secs: default_tombstone_retention(),
            alert_history: default_alert_history(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
            store_dir: None,
        }
    }
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            reconcile_interval_secs: default_reconcile_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            backoff_max_attempts: default_backoff_attempts(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            digest_listen: default_digest_listen(),
        }
    }
}

impl Default for DataplaneSection {
    fn default() -> Self {
        Self {
            flow_table_capacity: default_flow_table_capacity(),
            table: TableKind::default(),
            sim_tick_ms: default_sim_tick(),
            sim_max_burst: default_sim_burst(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            max_stall_secs: default_max_stall_seconds(),
            max_flush_failure_rate: default_max_flush_failure_rate(),
        }
    }
}

impl FlowtelConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::load(path)?;
            info!(path = %path.display(), "Loaded configuration");
            Ok(config)
        } else {
            warn!(path = %path.display(), "Configuration file not found, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.http_addr()?;
        self.digest_addr()?;

        if self.dataplane.flow_table_capacity == 0 {
            return Err(DaemonError::config(
                "dataplane.flow_table_capacity",
                "must be positive",
            ));
        }
        if self.dataplane.sim_tick_ms == 0 || self.dataplane.sim_max_burst == 0 {
            return Err(DaemonError::config(
                "dataplane.sim_tick_ms",
                "simulation tick and burst must be positive",
            ));
        }
        if let TableKind::Chained { bucket_depth: 0 } = self.dataplane.table {
            return Err(DaemonError::config(
                "dataplane.table.bucket_depth",
                "must be positive",
            ));
        }
        if self.collector.ingest_channel_capacity == 0 {
            return Err(DaemonError::config(
                "collector.ingest_channel_capacity",
                "must be positive",
            ));
        }
        if self.manager.backoff_base_ms > self.manager.backoff_max_ms {
            return Err(DaemonError::config(
                "manager.backoff_base_ms",
                format!("must not exceed backoff_max_ms ({})", self.manager.backoff_max_ms),
            ));
        }

        self.policy
            .validate()
            .map_err(|e| DaemonError::config("policy", e.to_string()))?;
        self.collector_config().validate()?;
        self.manager_config().validate()?;
        Ok(())
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        parse_addr("server.http_listen", &self.server.http_listen)
    }

    pub fn digest_addr(&self) -> Result<SocketAddr> {
        parse_addr("server.digest_listen", &self.server.digest_listen)
    }

    /// Digest consumer settings. The flush interval follows the policy's
    /// export interval.
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            batch_size: self.collector.batch_size,
            buffer_capacity: self.collector.buffer_capacity,
            flush_interval: self.policy.export_interval(),
            sweep_interval: Duration::from_secs(self.collector.sweep_interval_secs),
            tombstone_retention: Duration::from_secs(self.collector.tombstone_retention_secs),
            alert_history: self.collector.alert_history,
            ingest_channel_capacity: self.collector.ingest_channel_capacity,
            max_flush_stall: Duration::from_secs(self.health.max_stall_secs),
            max_flush_failure_rate: self.health.max_flush_failure_rate,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            request_timeout: Duration::from_millis(self.manager.request_timeout_ms),
            reconcile_interval: Duration::from_secs(self.manager.reconcile_interval_secs),
            heartbeat_interval: Duration::from_secs(self.manager.heartbeat_interval_secs),
            max_missed_heartbeats: self.manager.max_missed_heartbeats,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.manager.backoff_base_ms),
                max_delay: Duration::from_millis(self.manager.backoff_max_ms),
                max_attempts: self.manager.backoff_max_attempts,
            },
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            capacity: self.dataplane.flow_table_capacity,
            table: self.dataplane.table,
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| DaemonError::config(field, format!("{:?}: {}", value, e)))
}

//! Flow-telemetry collector.
//!
//! Consumes digests exported by switches and maintains the authoritative
//! flow view:
//!
//! - [`FlowRegistry`]: per `(switch, flow id)` reconciliation with
//!   monotonic counters and idle expiry
//! - [`FlushBuffer`]: bounded batching in front of a [`flowtel_common::FlowStore`]
//! - [`DigestConsumer`]: ingestion tasks, background flusher and sweeper
//! - [`FlowAlertEvaluator`]: threshold alerts on reconciled flows
//!
//! # Architecture
//!
//! ```text
//! switch sessions ──▶ DigestConsumer ──▶ FlowRegistry
//!                          │
//!                          ▼
//!                     FlushBuffer ──▶ FlowStore
//! ```

mod error;
pub mod alerts;
pub mod config;
pub mod consumer;
pub mod flush_buffer;
pub mod health;
pub mod json_store;
pub mod metrics;
pub mod registry;
pub mod statistics;

pub use alerts::{AlertKind, AlertSeverity, FlowAlert, FlowAlertEvaluator, PORT_SCAN_WINDOW};
pub use config::CollectorConfig;
pub use consumer::DigestConsumer;
pub use error::{CollectorError, Result};
pub use flush_buffer::{FlushBuffer, FlushStats};
pub use health::HealthMonitor;
pub use json_store::JsonLinesStore;
pub use metrics::{HealthStatus, MetricsCollector};
pub use registry::{Counter, FlowRegistry, UpsertOutcome};
pub use statistics::{CollectorStatistics, ProtocolShare, TopFlow};

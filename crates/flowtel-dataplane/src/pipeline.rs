//! Per-switch data-plane pipeline.
//!
//! identify → record → sample → export, synchronously per packet. Nothing
//! on this path awaits or performs blocking I/O.

use crate::error::Result;
use crate::exporter::{DigestExporter, DigestSink, ExporterStats};
use crate::flow_id::FlowIdentifier;
use crate::packet::PacketHeaders;
use crate::sampling::PolicyHandle;
use crate::state_table::{build_table, FlowRecord, FlowTable, TableKind};
use flowtel_common::{FlowId, FlowKey, PolicyConfig, SamplingPolicy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Result of processing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// No flow key could be derived (non-IPv4 or malformed).
    Skipped,
    /// The packet updated a flow.
    Recorded {
        record: FlowRecord,
        /// True if a digest was accepted by the sink.
        exported: bool,
    },
}

/// Data-plane pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub capacity: u32,
    pub table: TableKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 65_536,
            table: TableKind::Direct,
        }
    }
}

/// Packet processing pipeline for one switch.
pub struct FlowPipeline {
    identifier: FlowIdentifier,
    table: Box<dyn FlowTable>,
    policy: PolicyHandle,
    exporter: DigestExporter,
    skipped: AtomicU64,
}

impl FlowPipeline {
    /// Builds a pipeline exporting into `sink`.
    pub fn new(config: PipelineConfig, sink: Arc<dyn DigestSink>) -> Result<Self> {
        Ok(Self {
            identifier: FlowIdentifier::new(config.capacity)?,
            table: build_table(config.table, config.capacity)?,
            policy: PolicyHandle::default(),
            exporter: DigestExporter::new(sink),
            skipped: AtomicU64::new(0),
        })
    }

    /// Processes a raw Ethernet frame observed at `timestamp` µs.
    pub fn process_frame(&self, frame: &[u8], timestamp: u64) -> PacketOutcome {
        match PacketHeaders::parse(frame) {
            Some(headers) => self.process_headers(&headers, timestamp),
            None => self.skip(),
        }
    }

    /// Processes already-parsed headers.
    pub fn process_headers(&self, headers: &PacketHeaders, timestamp: u64) -> PacketOutcome {
        match headers.flow_key() {
            Some(key) => self.process_key(&key, headers.frame_len, timestamp),
            None => self.skip(),
        }
    }

    /// Processes a packet of `size` bytes belonging to `key`.
    pub fn process_key(&self, key: &FlowKey, size: u32, timestamp: u64) -> PacketOutcome {
        let flow_id = self.identifier.identify(key);
        let record = self.table.record_packet(key, flow_id, timestamp, size);

        // One snapshot for both the sampling decision and the export fields.
        let policy = self.policy.current();
        let exported = crate::sampling::should_export(
            record.packet_count,
            policy.interval_for(key.protocol),
        ) && self
            .exporter
            .export(&record, key, size, timestamp, &policy);

        PacketOutcome::Recorded { record, exported }
    }

    fn skip(&self) -> PacketOutcome {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        PacketOutcome::Skipped
    }

    /// Validates and installs a new policy. The previous policy stays in
    /// force on error.
    pub fn apply_policy(&self, config: &PolicyConfig) -> Result<()> {
        self.policy.apply(config)?;
        info!(
            sampling_rate = config.sampling_rate_default,
            overrides = config.per_protocol_overrides.len(),
            "Sampling policy applied"
        );
        Ok(())
    }

    /// Policy currently in force.
    pub fn current_policy(&self) -> Arc<SamplingPolicy> {
        self.policy.current()
    }

    /// Computes the id a key maps to.
    pub fn flow_id(&self, key: &FlowKey) -> FlowId {
        self.identifier.identify(key)
    }

    /// Current state of the slot a key maps to.
    pub fn snapshot(&self, key: &FlowKey) -> FlowRecord {
        self.table.snapshot(key, self.identifier.identify(key))
    }

    /// Occupied table slots.
    pub fn occupied(&self) -> usize {
        self.table.occupied()
    }

    /// Packets without a usable flow key.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Exporter counters.
    pub fn exporter_stats(&self) -> &ExporterStats {
        self.exporter.stats()
    }
}

//! Flow-telemetry data plane.
//!
//! Everything here runs synchronously on the packet path:
//!
//! - [`FlowIdentifier`]: CRC-32 flow key hashing onto table slots
//! - [`FlowTable`]: fixed-capacity per-flow counters
//!   ([`DirectFlowTable`], [`ChainedFlowTable`])
//! - [`should_export`]: 1-in-N sampling decision
//! - [`DigestExporter`]: non-blocking digest export over a [`DigestSink`]
//! - [`FlowPipeline`]: the four stages wired together for one switch

mod error;
pub mod exporter;
pub mod flow_id;
pub mod packet;
pub mod pipeline;
pub mod sampling;
pub mod state_table;

pub use error::{DataplaneError, Result, SinkError};
pub use exporter::{ChannelSink, DigestExporter, DigestSink, ExporterStats, UdpSink, UDP_TOKEN_LEN};
pub use flow_id::FlowIdentifier;
pub use packet::PacketHeaders;
pub use pipeline::{FlowPipeline, PacketOutcome, PipelineConfig};
pub use sampling::{should_export, PolicyHandle};
pub use state_table::{
    build_table, ChainedFlowTable, DirectFlowTable, FlowRecord, FlowTable, TableKind,
};

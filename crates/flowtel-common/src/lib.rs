//! Common flow-telemetry types.
//!
//! This crate provides the types shared by the data plane and the control
//! plane of the telemetry pipeline:
//!
//! - [`FlowKey`] and [`FlowId`]: directional 5-tuple and its table slot index
//! - [`DigestMessage`]: fixed-width snapshot exported by a switch
//! - [`PolicyConfig`] and [`SamplingPolicy`]: operator policy and the
//!   per-packet view derived from it
//! - [`FlowStore`] and [`SwitchStatusStore`]: storage collaborator traits
//!
//! # Architecture
//!
//! 1. A switch identifies each packet's flow and updates its counters
//! 2. The sampling policy decides whether the update is exported
//! 3. Exported snapshots travel as [`DigestMessage`] frames
//! 4. The collector reconciles frames into persisted flow records

mod error;
mod types;
pub mod digest;
pub mod policy;
pub mod store;

pub use digest::{DigestFrame, DigestMessage, DIGEST_LEN};
pub use error::{CommonError, DigestError, PolicyError, Result};
pub use policy::{AlertThresholds, Feature, PolicyConfig, SamplingPolicy};
pub use store::{
    FlowStatus, FlowStore, MemoryFlowStore, MemorySwitchStatusStore, PersistedFlow, StoreError,
    SwitchStatus, SwitchStatusStore,
};
pub use types::{now_micros, protocol_name, FlowId, FlowKey, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};

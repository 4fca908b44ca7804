//! Flow identity types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// IP protocol number for ICMP.
pub const IPPROTO_ICMP: u8 = 1;
/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Directional 5-tuple identifying a flow.
///
/// Forward and reverse traffic of one conversation are distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    /// Length of the canonical byte serialization.
    pub const ENCODED_LEN: usize = 13;

    /// Creates a new flow key.
    pub fn new(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        protocol: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            protocol,
            src_port,
            dst_port,
        }
    }

    /// Canonical big-endian serialization used for hashing.
    ///
    /// Layout: `src_addr ‖ dst_addr ‖ protocol ‖ src_port ‖ dst_port`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.src_addr.octets());
        out[4..8].copy_from_slice(&self.dst_addr.octets());
        out[8] = self.protocol;
        out[9..11].copy_from_slice(&self.src_port.to_be_bytes());
        out[11..13].copy_from_slice(&self.dst_port.to_be_bytes());
        out
    }

    /// Returns the key of the opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            protocol: self.protocol,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            protocol_name(self.protocol)
        )
    }
}

/// Index of a flow's slot in a switch's state table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub u32);

impl FlowId {
    /// Returns the raw value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Returns the value as a slot index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FlowId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Human-readable protocol label used in statistics.
pub fn protocol_name(protocol: u8) -> String {
    match protocol {
        IPPROTO_ICMP => "ICMP".to_string(),
        IPPROTO_TCP => "TCP".to_string(),
        IPPROTO_UDP => "UDP".to_string(),
        other => format!("Protocol-{}", other),
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

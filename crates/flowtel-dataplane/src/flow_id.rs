//! Flow identification.
//!
//! Maps a [`FlowKey`] to a slot index in `[0, C)` with CRC-32 (IEEE 802.3)
//! over the key's canonical big-endian bytes. Equal keys always yield equal
//! ids; distinct keys may collide.

use crate::error::{DataplaneError, Result};
use crate::packet::PacketHeaders;
use flowtel_common::{FlowId, FlowKey};

/// Hashes flow keys onto a fixed number of table slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowIdentifier {
    capacity: u32,
}

impl FlowIdentifier {
    /// Creates an identifier for a table of `capacity` slots.
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(DataplaneError::InvalidCapacity(capacity));
        }
        Ok(Self { capacity })
    }

    /// Number of slots ids are reduced into.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Computes the flow id for a key.
    pub fn identify(&self, key: &FlowKey) -> FlowId {
        FlowId(crc32fast::hash(&key.to_bytes()) % self.capacity)
    }

    /// Extracts the key from parsed headers and computes its id.
    ///
    /// Returns `None` for packets without an IPv4 header.
    pub fn identify_headers(&self, headers: &PacketHeaders) -> Option<(FlowKey, FlowId)> {
        let key = headers.flow_key()?;
        Some((key, self.identify(&key)))
    }
}

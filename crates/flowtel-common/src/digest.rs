//! Digest wire codec.
//!
//! A digest is a fixed 35-byte big-endian record:
//!
//! | Field                  | Bits |
//! |------------------------|------|
//! | flow id                | 32   |
//! | source address         | 32   |
//! | destination address    | 32   |
//! | protocol               | 8    |
//! | source port            | 16   |
//! | destination port       | 16   |
//! | packet count           | 32   |
//! | byte count             | 32   |
//! | timestamp (µs)         | 48   |
//! | flow duration (ms)     | 16   |
//! | triggering packet size | 16   |

use crate::error::DigestError;
use crate::types::{FlowId, FlowKey};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::net::Ipv4Addr;

/// Encoded digest length in bytes.
pub const DIGEST_LEN: usize = 35;

/// Encoded digest as carried over in-process channels.
pub type DigestFrame = [u8; DIGEST_LEN];

const TIMESTAMP_MASK: u64 = (1 << 48) - 1;

/// Snapshot of a flow record, exported by the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestMessage {
    pub flow_id: FlowId,
    pub key: FlowKey,
    pub packet_count: u32,
    pub byte_count: u32,
    /// Switch clock in microseconds, truncated to 48 bits on the wire.
    pub timestamp: u64,
    /// Flow duration estimate in milliseconds.
    pub flow_duration_ms: u16,
    /// Size of the packet that triggered the export.
    pub packet_size: u16,
}

impl DigestMessage {
    /// Encodes the message into its wire form.
    pub fn encode(&self) -> DigestFrame {
        let mut buf = [0u8; DIGEST_LEN];
        BigEndian::write_u32(&mut buf[0..4], self.flow_id.value());
        buf[4..8].copy_from_slice(&self.key.src_addr.octets());
        buf[8..12].copy_from_slice(&self.key.dst_addr.octets());
        buf[12] = self.key.protocol;
        BigEndian::write_u16(&mut buf[13..15], self.key.src_port);
        BigEndian::write_u16(&mut buf[15..17], self.key.dst_port);
        BigEndian::write_u32(&mut buf[17..21], self.packet_count);
        BigEndian::write_u32(&mut buf[21..25], self.byte_count);
        BigEndian::write_uint(&mut buf[25..31], self.timestamp & TIMESTAMP_MASK, 6);
        BigEndian::write_u16(&mut buf[31..33], self.flow_duration_ms);
        BigEndian::write_u16(&mut buf[33..35], self.packet_size);
        buf
    }

    /// Decodes a message from its wire form.
    pub fn decode(frame: &[u8]) -> Result<Self, DigestError> {
        if frame.len() != DIGEST_LEN {
            return Err(DigestError::InvalidLength {
                expected: DIGEST_LEN,
                actual: frame.len(),
            });
        }

        let mut rdr = Cursor::new(frame);
        let msg = read_fields(&mut rdr).map_err(|_| DigestError::InvalidLength {
            expected: DIGEST_LEN,
            actual: frame.len(),
        })?;

        if msg.packet_count == 0 {
            return Err(DigestError::ZeroPacketCount {
                flow_id: msg.flow_id.value(),
            });
        }
        Ok(msg)
    }
}

fn read_fields(rdr: &mut Cursor<&[u8]>) -> std::io::Result<DigestMessage> {
    let flow_id = FlowId(rdr.read_u32::<BigEndian>()?);
    let src_addr = Ipv4Addr::from(rdr.read_u32::<BigEndian>()?);
    let dst_addr = Ipv4Addr::from(rdr.read_u32::<BigEndian>()?);
    let protocol = rdr.read_u8()?;
    let src_port = rdr.read_u16::<BigEndian>()?;
    let dst_port = rdr.read_u16::<BigEndian>()?;
    let packet_count = rdr.read_u32::<BigEndian>()?;
    let byte_count = rdr.read_u32::<BigEndian>()?;
    let timestamp = rdr.read_uint::<BigEndian>(6)?;
    let flow_duration_ms = rdr.read_u16::<BigEndian>()?;
    let packet_size = rdr.read_u16::<BigEndian>()?;

    Ok(DigestMessage {
        flow_id,
        key: FlowKey::new(src_addr, dst_addr, protocol, src_port, dst_port),
        packet_count,
        byte_count,
        timestamp,
        flow_duration_ms,
        packet_size,
    })
}

/// Converts a microsecond interval to the saturating 16-bit millisecond
/// duration carried on the wire.
pub fn duration_ms(first_seen: u64, last_seen: u64) -> u16 {
    let ms = last_seen.saturating_sub(first_seen) / 1_000;
    u16::try_from(ms).unwrap_or(u16::MAX)
}

/// Clamps a packet length to the 16-bit wire field.
pub fn packet_size_field(size: u32) -> u16 {
    u16::try_from(size).unwrap_or(u16::MAX)
}

//! Packet header extraction.
//!
//! Parses just enough of an Ethernet II frame to build a flow key:
//! optional 802.1Q / 802.1ad tags, the IPv4 header and TCP/UDP ports.
//! Parsing borrows the frame and never allocates.

use byteorder::{BigEndian, ByteOrder};
use flowtel_common::{FlowKey, IPPROTO_TCP, IPPROTO_UDP};
use std::net::Ipv4Addr;

const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const MAX_VLAN_TAGS: usize = 2;
const IPV4_MIN_HEADER_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;

/// IPv4 header fields relevant to flow tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub total_len: u16,
    pub fragment_offset: u16,
}

/// Headers extracted from one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeaders {
    /// Innermost ethertype after VLAN tags.
    pub ethertype: u16,
    /// Outer VLAN id, if tagged.
    pub vlan_id: Option<u16>,
    pub ipv4: Option<Ipv4Header>,
    /// `(src_port, dst_port)` for TCP and UDP first fragments.
    pub ports: Option<(u16, u16)>,
    /// Length of the whole frame in bytes.
    pub frame_len: u32,
}

impl PacketHeaders {
    /// Parses a raw Ethernet frame.
    ///
    /// Returns `None` if the Ethernet, VLAN or IPv4 header is truncated or
    /// malformed. A truncated transport header only leaves `ports` unset.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }

        let mut offset = 12;
        let mut ethertype = BigEndian::read_u16(&frame[offset..offset + 2]);
        offset += 2;
        let mut vlan_id = None;

        let mut tags = 0;
        while matches!(ethertype, ETHERTYPE_VLAN | ETHERTYPE_QINQ) {
            if tags == MAX_VLAN_TAGS || frame.len() < offset + VLAN_TAG_LEN {
                return None;
            }
            let tci = BigEndian::read_u16(&frame[offset..offset + 2]);
            vlan_id.get_or_insert(tci & 0x0fff);
            ethertype = BigEndian::read_u16(&frame[offset + 2..offset + 4]);
            offset += VLAN_TAG_LEN;
            tags += 1;
        }

        let frame_len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
        let mut headers = PacketHeaders {
            ethertype,
            vlan_id,
            ipv4: None,
            ports: None,
            frame_len,
        };

        if ethertype != ETHERTYPE_IPV4 {
            return Some(headers);
        }

        let ip = &frame[offset..];
        if ip.len() < IPV4_MIN_HEADER_LEN || ip[0] >> 4 != 4 {
            return None;
        }
        let ihl = usize::from(ip[0] & 0x0f) * 4;
        if ihl < IPV4_MIN_HEADER_LEN || ip.len() < ihl {
            return None;
        }

        let ipv4 = Ipv4Header {
            src_addr: Ipv4Addr::from(BigEndian::read_u32(&ip[12..16])),
            dst_addr: Ipv4Addr::from(BigEndian::read_u32(&ip[16..20])),
            protocol: ip[9],
            total_len: BigEndian::read_u16(&ip[2..4]),
            fragment_offset: BigEndian::read_u16(&ip[6..8]) & 0x1fff,
        };
        headers.ipv4 = Some(ipv4);

        let l4 = &ip[ihl..];
        if matches!(ipv4.protocol, IPPROTO_TCP | IPPROTO_UDP)
            && ipv4.fragment_offset == 0
            && l4.len() >= 4
        {
            headers.ports = Some((
                BigEndian::read_u16(&l4[0..2]),
                BigEndian::read_u16(&l4[2..4]),
            ));
        }

        Some(headers)
    }

    /// True for IPv6 frames, which carry addresses wider than a flow key.
    pub fn is_ipv6(&self) -> bool {
        self.ethertype == ETHERTYPE_IPV6
    }

    /// Builds the directional flow key.
    ///
    /// `None` for non-IPv4 packets. Packets without ports use port 0.
    pub fn flow_key(&self) -> Option<FlowKey> {
        let ip = self.ipv4?;
        let (src_port, dst_port) = self.ports.unwrap_or((0, 0));
        Some(FlowKey::new(
            ip.src_addr,
            ip.dst_addr,
            ip.protocol,
            src_port,
            dst_port,
        ))
    }
}

/// Builds a minimal Ethernet + IPv4 + L4 frame for a key.
///
/// Used by traffic generators; the payload is zero-filled up to `frame_len`.
pub fn build_frame(key: &FlowKey, frame_len: usize) -> Vec<u8> {
    let l4_len = match key.protocol {
        IPPROTO_TCP => 20,
        IPPROTO_UDP => 8,
        _ => 8,
    };
    let min_len = ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + l4_len;
    let len = frame_len.max(min_len);
    let mut frame = vec![0u8; len];

    BigEndian::write_u16(&mut frame[12..14], ETHERTYPE_IPV4);

    let ip = &mut frame[ETH_HEADER_LEN..];
    ip[0] = 0x45;
    let ip_total = u16::try_from(len - ETH_HEADER_LEN).unwrap_or(u16::MAX);
    BigEndian::write_u16(&mut ip[2..4], ip_total);
    ip[8] = 64;
    ip[9] = key.protocol;
    ip[12..16].copy_from_slice(&key.src_addr.octets());
    ip[16..20].copy_from_slice(&key.dst_addr.octets());

    if matches!(key.protocol, IPPROTO_TCP | IPPROTO_UDP) {
        let l4 = &mut ip[IPV4_MIN_HEADER_LEN..];
        BigEndian::write_u16(&mut l4[0..2], key.src_port);
        BigEndian::write_u16(&mut l4[2..4], key.dst_port);
    }

    frame
}

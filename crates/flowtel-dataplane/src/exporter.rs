//! Digest export.
//!
//! The exporter turns a flow snapshot into a [`DigestMessage`] and hands
//! it to a [`DigestSink`] without blocking. Delivery is best effort: a
//! digest that cannot be queued is dropped and counted, never retried.

use crate::error::{Result, SinkError};
use crate::state_table::FlowRecord;
use flowtel_common::digest::{duration_ms, packet_size_field};
use flowtel_common::{DigestFrame, DigestMessage, Feature, FlowKey, SamplingPolicy};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Non-blocking digest transport.
pub trait DigestSink: Send + Sync {
    /// Queues one encoded digest.
    fn try_send(&self, frame: DigestFrame) -> std::result::Result<(), SinkError>;
}

/// In-process sink feeding a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DigestFrame>,
}

impl ChannelSink {
    /// Creates a sink and the receiver to attach to a consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DigestFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Wraps an existing sender.
    pub fn new(tx: mpsc::Sender<DigestFrame>) -> Self {
        Self { tx }
    }
}

impl DigestSink for ChannelSink {
    fn try_send(&self, frame: DigestFrame) -> std::result::Result<(), SinkError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Length of the session token prefix on UDP datagrams.
pub const UDP_TOKEN_LEN: usize = 8;

/// Sink sending each digest as one UDP datagram prefixed with the
/// switch's session token.
#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
    token: u64,
}

impl UdpSink {
    /// Binds an ephemeral non-blocking socket towards `target`.
    pub fn connect(target: SocketAddr, token: u64) -> Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            target,
            token,
        })
    }

    /// Local address of the sending socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl DigestSink for UdpSink {
    fn try_send(&self, frame: DigestFrame) -> std::result::Result<(), SinkError> {
        let mut datagram = [0u8; UDP_TOKEN_LEN + flowtel_common::DIGEST_LEN];
        datagram[..UDP_TOKEN_LEN].copy_from_slice(&self.token.to_be_bytes());
        datagram[UDP_TOKEN_LEN..].copy_from_slice(&frame);
        match self.socket.send_to(&datagram, self.target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SinkError::Full),
            Err(e) => Err(SinkError::Transport(e.to_string())),
        }
    }
}

/// Export counters.
#[derive(Debug, Default)]
pub struct ExporterStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ExporterStats {
    /// Digests accepted by the sink.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Digests the sink refused.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Builds digests and pushes them to a sink.
pub struct DigestExporter {
    sink: Arc<dyn DigestSink>,
    stats: ExporterStats,
}

impl DigestExporter {
    /// Creates an exporter over `sink`.
    pub fn new(sink: Arc<dyn DigestSink>) -> Self {
        Self {
            sink,
            stats: ExporterStats::default(),
        }
    }

    /// Builds the digest for a snapshot.
    ///
    /// Fields for disabled features are zeroed.
    pub fn build_message(
        record: &FlowRecord,
        key: &FlowKey,
        packet_size: u32,
        timestamp: u64,
        policy: &SamplingPolicy,
    ) -> DigestMessage {
        let byte_count = if policy.has_feature(Feature::ByteCount) {
            record.byte_count
        } else {
            0
        };
        let flow_duration_ms = if policy.has_feature(Feature::FlowDuration) {
            duration_ms(record.first_seen, record.last_seen)
        } else {
            0
        };

        DigestMessage {
            flow_id: record.flow_id,
            key: *key,
            packet_count: record.packet_count,
            byte_count,
            timestamp,
            flow_duration_ms,
            packet_size: packet_size_field(packet_size),
        }
    }

    /// Exports one snapshot. Returns true if the sink accepted it.
    pub fn export(
        &self,
        record: &FlowRecord,
        key: &FlowKey,
        packet_size: u32,
        timestamp: u64,
        policy: &SamplingPolicy,
    ) -> bool {
        let msg = Self::build_message(record, key, packet_size, timestamp, policy);
        match self.sink.try_send(msg.encode()) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(flow_id = %record.flow_id, error = %e, "Digest dropped");
                false
            }
        }
    }

    /// Export counters.
    pub fn stats(&self) -> &ExporterStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtel_common::{FlowId, PolicyConfig, IPPROTO_TCP};
    use std::net::Ipv4Addr;

    fn key() -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            IPPROTO_TCP,
            1111,
            80,
        )
    }

    fn record() -> FlowRecord {
        FlowRecord {
            flow_id: FlowId(9),
            packet_count: 11,
            byte_count: 5_000,
            first_seen: 1_000_000,
            last_seen: 1_500_000,
        }
    }

    #[test]
    fn test_build_message_all_features() {
        let msg = DigestExporter::build_message(
            &record(),
            &key(),
            1500,
            1_500_000,
            &SamplingPolicy::default(),
        );
        assert_eq!(msg.flow_id, FlowId(9));
        assert_eq!(msg.packet_count, 11);
        assert_eq!(msg.byte_count, 5_000);
        assert_eq!(msg.flow_duration_ms, 500);
        assert_eq!(msg.packet_size, 1500);
    }

    #[test]
    fn test_build_message_disabled_features_zeroed() {
        let mut config = PolicyConfig::default();
        config.enabled_features.remove(&Feature::ByteCount);
        config.enabled_features.remove(&Feature::FlowDuration);
        let policy = SamplingPolicy::new(&config).unwrap();

        let msg = DigestExporter::build_message(&record(), &key(), 64, 0, &policy);
        assert_eq!(msg.byte_count, 0);
        assert_eq!(msg.flow_duration_ms, 0);
        assert_eq!(msg.packet_count, 11);
    }

    #[tokio::test]
    async fn test_channel_sink_counts_drops_when_full() {
        let (sink, mut rx) = ChannelSink::channel(1);
        let exporter = DigestExporter::new(Arc::new(sink));
        let policy = SamplingPolicy::default();

        assert!(exporter.export(&record(), &key(), 64, 1, &policy));
        assert!(!exporter.export(&record(), &key(), 64, 2, &policy));
        assert_eq!(exporter.stats().sent(), 1);
        assert_eq!(exporter.stats().dropped(), 1);

        let frame = rx.recv().await.unwrap();
        let msg = DigestMessage::decode(&frame).unwrap();
        assert_eq!(msg.timestamp, 1);
    }

    #[test]
    fn test_channel_sink_closed() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        assert_eq!(sink.try_send([0u8; 35]), Err(SinkError::Closed));
    }

    #[test]
    fn test_udp_sink_prefixes_token() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = receiver.local_addr().unwrap();
        let sink = UdpSink::connect(target, 0xdead_beef_0000_0001).unwrap();

        let frame = DigestExporter::build_message(
            &record(),
            &key(),
            64,
            7,
            &SamplingPolicy::default(),
        )
        .encode();
        sink.try_send(frame).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(len, UDP_TOKEN_LEN + flowtel_common::DIGEST_LEN);
        assert_eq!(&buf[..8], &0xdead_beef_0000_0001u64.to_be_bytes());
        assert_eq!(&buf[8..len], &frame);
    }
}

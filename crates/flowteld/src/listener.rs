//! UDP digest listener.
//!
//! Each datagram carries one digest prefixed with the sending switch's
//! session token: `token (8 bytes, big-endian) || digest (35 bytes)`.
//! The token resolves the switch through the rule manager; datagrams with
//! a bad length or an unknown token are counted and dropped. Accepted
//! digests are queued on the switch's own ingestion session, and the
//! socket loop never waits on reconciliation or storage.

use byteorder::{BigEndian, ByteOrder};
use flowtel_collector::{CollectorError, DigestConsumer};
use flowtel_common::{DigestFrame, DIGEST_LEN};
use flowtel_dataplane::UDP_TOKEN_LEN;
use flowtel_rulemgr::FlowRuleManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Size of a well-formed datagram.
pub const DATAGRAM_LEN: usize = UDP_TOKEN_LEN + DIGEST_LEN;

/// Receives token-framed digests and feeds them to the consumer.
pub struct DigestListener {
    socket: UdpSocket,
    consumer: Arc<DigestConsumer>,
    manager: Arc<FlowRuleManager>,
}

/// Splits a datagram into its session token and digest frame.
pub fn split_datagram(datagram: &[u8]) -> Option<(u64, DigestFrame)> {
    if datagram.len() != DATAGRAM_LEN {
        return None;
    }
    let token = BigEndian::read_u64(&datagram[..UDP_TOKEN_LEN]);
    let frame = DigestFrame::try_from(&datagram[UDP_TOKEN_LEN..]).ok()?;
    Some((token, frame))
}

impl DigestListener {
    pub async fn bind(
        addr: SocketAddr,
        consumer: Arc<DigestConsumer>,
        manager: Arc<FlowRuleManager>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            consumer,
            manager,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.socket.local_addr() {
            info!(addr = %addr, "Digest listener started");
        }

        // One spare byte so oversized datagrams are detected rather than
        // silently truncated to a valid length.
        let mut buf = [0u8; DATAGRAM_LEN + 1];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            match received {
                Ok((len, peer)) => self.handle(&buf[..len], peer),
                Err(e) => warn!(error = %e, "Digest socket receive failed"),
            }
        }
        debug!("Digest listener stopped");
    }

    fn handle(&self, datagram: &[u8], peer: SocketAddr) {
        let Some((token, frame)) = split_datagram(datagram) else {
            self.consumer.metrics().frames_rejected_total.inc();
            debug!(peer = %peer, len = datagram.len(), "Datagram with bad length dropped");
            return;
        };
        let Some(switch_id) = self.manager.switch_for_token(token) else {
            self.consumer.metrics().frames_rejected_total.inc();
            debug!(peer = %peer, "Datagram with unknown session token dropped");
            return;
        };
        // Decode failures are counted and logged by the session task.
        match self.consumer.enqueue_frame(&switch_id, frame) {
            Ok(()) => trace!(switch_id = %switch_id, "Digest queued"),
            Err(CollectorError::SessionBacklog { .. }) => {
                self.consumer.metrics().frames_rejected_total.inc();
                debug!(switch_id = %switch_id, "Ingestion queue full, digest dropped");
            }
            Err(e) => {
                self.consumer.metrics().frames_rejected_total.inc();
                debug!(switch_id = %switch_id, error = %e, "Digest dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_datagram() {
        let mut datagram = [0u8; DATAGRAM_LEN];
        datagram[..8].copy_from_slice(&0xdead_beef_0000_0001u64.to_be_bytes());
        datagram[8] = 0x7f;
        let (token, frame) = split_datagram(&datagram).unwrap();
        assert_eq!(token, 0xdead_beef_0000_0001);
        assert_eq!(frame.len(), DIGEST_LEN);
        assert_eq!(frame[0], 0x7f);
    }

    #[test]
    fn test_split_rejects_bad_lengths() {
        assert!(split_datagram(&[0u8; DATAGRAM_LEN - 1]).is_none());
        assert!(split_datagram(&[0u8; DATAGRAM_LEN + 1]).is_none());
        assert!(split_datagram(&[]).is_none());
    }
}

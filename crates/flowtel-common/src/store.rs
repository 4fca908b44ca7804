//! Durable storage collaborators.
//!
//! The control plane only needs two capabilities from its storage engines:
//! appending batches of flow snapshots and upserting per-switch status.
//! Both are modelled as async traits so relational, time-series or file
//! backends can be plugged in.

use crate::digest::DigestMessage;
use crate::types::{FlowId, FlowKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Storage backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend temporarily unreachable or overloaded.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Local I/O failure.
    #[error("Store I/O error: {0}")]
    Io(String),

    /// Record could not be encoded.
    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Returns true if retrying the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Lifecycle of a persisted flow instance. Active → Expired only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Expired,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Active => write!(f, "active"),
            FlowStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Control-plane view of one flow instance.
///
/// `first_seen`/`last_seen` are collector clock times of the first and last
/// accepted digest; the `switch_*` fields carry the switch clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedFlow {
    pub instance_id: Uuid,
    pub switch_id: String,
    pub flow_id: FlowId,
    pub key: FlowKey,
    pub packet_count: u32,
    pub byte_count: u32,
    pub first_seen: u64,
    pub last_seen: u64,
    pub switch_first_seen: u64,
    pub switch_last_seen: u64,
    pub status: FlowStatus,
    pub expired_at: Option<u64>,
}

impl PersistedFlow {
    /// Starts a new instance from its first accepted digest.
    pub fn from_digest(switch_id: &str, digest: &DigestMessage, now: u64) -> Self {
        let duration_micros = u64::from(digest.flow_duration_ms) * 1_000;
        Self {
            instance_id: Uuid::new_v4(),
            switch_id: switch_id.to_string(),
            flow_id: digest.flow_id,
            key: digest.key,
            packet_count: digest.packet_count,
            byte_count: digest.byte_count,
            first_seen: now,
            last_seen: now,
            switch_first_seen: digest.timestamp.saturating_sub(duration_micros),
            switch_last_seen: digest.timestamp,
            status: FlowStatus::Active,
            expired_at: None,
        }
    }

    /// Applies a newer digest. Callers enforce the monotonic guard.
    ///
    /// A digest exported with byte counting disabled carries a zero byte
    /// count; the stored byte count is kept in that case.
    pub fn apply_digest(&mut self, digest: &DigestMessage, now: u64) {
        self.packet_count = digest.packet_count;
        self.byte_count = self.byte_count.max(digest.byte_count);
        self.last_seen = self.last_seen.max(now);
        self.switch_last_seen = self.switch_last_seen.max(digest.timestamp);
    }

    /// Marks the instance expired. Has no effect on an expired instance.
    pub fn expire(&mut self, now: u64) {
        if self.status == FlowStatus::Active {
            self.status = FlowStatus::Expired;
            self.expired_at = Some(now);
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == FlowStatus::Active
    }

    /// Flow lifetime according to the switch clock, in microseconds.
    pub fn switch_duration_micros(&self) -> u64 {
        self.switch_last_seen.saturating_sub(self.switch_first_seen)
    }
}

/// Status row reported for a switch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchStatus {
    pub switch_id: String,
    pub device_id: String,
    pub control_address: String,
    /// Session state name, e.g. "active" or "degraded".
    pub state: String,
    pub missed_heartbeats: u32,
    /// Last successful heartbeat, µs since epoch.
    pub last_heartbeat: Option<u64>,
    /// Time of this report, µs since epoch.
    pub updated_at: u64,
}

/// Append-only sink for flow snapshots.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn append_flow_batch(&self, records: &[PersistedFlow]) -> Result<(), StoreError>;
}

/// Upsert sink for switch status.
#[async_trait]
pub trait SwitchStatusStore: Send + Sync {
    async fn upsert_switch_status(
        &self,
        switch_id: &str,
        status: SwitchStatus,
    ) -> Result<(), StoreError>;
}

/// In-memory flow store recording every appended batch.
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    batches: Mutex<Vec<Vec<PersistedFlow>>>,
    fail_next: AtomicUsize,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` appends fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// All batches appended so far.
    pub fn batches(&self) -> Vec<Vec<PersistedFlow>> {
        self.batches.lock().clone()
    }

    /// All records appended so far, in order.
    pub fn records(&self) -> Vec<PersistedFlow> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Number of records appended so far.
    pub fn record_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn append_flow_batch(&self, records: &[PersistedFlow]) -> Result<(), StoreError> {
        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.batches.lock().push(records.to_vec());
        Ok(())
    }
}

/// In-memory switch status store keeping the latest row and full history.
#[derive(Debug, Default)]
pub struct MemorySwitchStatusStore {
    latest: Mutex<HashMap<String, SwitchStatus>>,
    history: Mutex<Vec<SwitchStatus>>,
}

impl MemorySwitchStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status for a switch.
    pub fn get(&self, switch_id: &str) -> Option<SwitchStatus> {
        self.latest.lock().get(switch_id).cloned()
    }

    /// State names reported for a switch, oldest first.
    pub fn states_for(&self, switch_id: &str) -> Vec<String> {
        self.history
            .lock()
            .iter()
            .filter(|s| s.switch_id == switch_id)
            .map(|s| s.state.clone())
            .collect()
    }
}

#[async_trait]
impl SwitchStatusStore for MemorySwitchStatusStore {
    async fn upsert_switch_status(
        &self,
        switch_id: &str,
        status: SwitchStatus,
    ) -> Result<(), StoreError> {
        self.history.lock().push(status.clone());
        self.latest.lock().insert(switch_id.to_string(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IPPROTO_TCP;
    use std::net::Ipv4Addr;

    fn digest(packets: u32, ts: u64) -> DigestMessage {
        DigestMessage {
            flow_id: FlowId(1),
            key: FlowKey::new(
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(2, 2, 2, 2),
                IPPROTO_TCP,
                10,
                20,
            ),
            packet_count: packets,
            byte_count: packets * 100,
            timestamp: ts,
            flow_duration_ms: 2,
            packet_size: 100,
        }
    }

    #[test]
    fn test_from_digest() {
        let flow = PersistedFlow::from_digest("s1", &digest(1, 10_000), 99);
        assert_eq!(flow.switch_id, "s1");
        assert_eq!(flow.first_seen, 99);
        assert_eq!(flow.switch_first_seen, 8_000);
        assert_eq!(flow.switch_last_seen, 10_000);
        assert!(flow.is_active());
    }

    #[test]
    fn test_apply_digest_keeps_bytes_when_unreported() {
        let mut flow = PersistedFlow::from_digest("s1", &digest(5, 0), 0);
        let mut next = digest(6, 10);
        next.byte_count = 0;
        flow.apply_digest(&next, 1);
        assert_eq!(flow.packet_count, 6);
        assert_eq!(flow.byte_count, 500);
    }

    #[test]
    fn test_expire_is_one_way() {
        let mut flow = PersistedFlow::from_digest("s1", &digest(1, 0), 0);
        flow.expire(50);
        flow.expire(80);
        assert_eq!(flow.status, FlowStatus::Expired);
        assert_eq!(flow.expired_at, Some(50));
    }

    #[test]
    fn test_store_error_retryable() {
        assert!(StoreError::Unavailable("x".into()).is_retryable());
        assert!(!StoreError::Serialization("x".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_memory_flow_store_injected_failure() {
        let store = MemoryFlowStore::new();
        let flow = PersistedFlow::from_digest("s1", &digest(1, 0), 0);
        store.fail_next(1);
        assert!(store.append_flow_batch(&[flow.clone()]).await.is_err());
        assert!(store.append_flow_batch(&[flow]).await.is_ok());
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_switch_status_history() {
        let store = MemorySwitchStatusStore::new();
        for state in ["registering", "active"] {
            let status = SwitchStatus {
                switch_id: "s1".into(),
                device_id: "dev".into(),
                control_address: "127.0.0.1:9559".into(),
                state: state.into(),
                missed_heartbeats: 0,
                last_heartbeat: None,
                updated_at: 0,
            };
            store.upsert_switch_status("s1", status).await.unwrap();
        }
        assert_eq!(store.states_for("s1"), vec!["registering", "active"]);
        assert_eq!(store.get("s1").map(|s| s.state), Some("active".to_string()));
    }
}

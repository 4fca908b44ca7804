//! Per-flow reconciliation state.
//!
//! Flows are keyed by `(switch_id, flow_id)` in a sharded map, so updates
//! to one flow lock only that flow's shard and never a global table.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flowtel_common::{DigestMessage, FlowId, FlowStatus, PersistedFlow};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Registry key: one flow slot on one switch.
pub type FlowSlotKey = (String, FlowId);

/// A monotonic flow counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Packets,
    Bytes,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Counter::Packets => write!(f, "packet_count"),
            Counter::Bytes => write!(f, "byte_count"),
        }
    }
}

/// What an incoming digest did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First digest for the slot.
    Created(PersistedFlow),
    /// Digest arrived after expiry and started a new instance.
    Restarted(PersistedFlow),
    /// Counters advanced.
    Updated(PersistedFlow),
    /// A counter lower than stored; dropped.
    Regression {
        counter: Counter,
        stored: u32,
        incoming: u32,
    },
    /// Same counters as stored; dropped.
    Duplicate,
}

impl UpsertOutcome {
    /// Snapshot to persist, if the digest was applied.
    pub fn applied(&self) -> Option<&PersistedFlow> {
        match self {
            UpsertOutcome::Created(f) | UpsertOutcome::Restarted(f) | UpsertOutcome::Updated(f) => {
                Some(f)
            }
            UpsertOutcome::Regression { .. } | UpsertOutcome::Duplicate => None,
        }
    }

    /// True for outcomes that begin a new instance.
    pub fn is_new_instance(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_) | UpsertOutcome::Restarted(_))
    }
}

/// Sharded map of persisted flows.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    flows: DashMap<FlowSlotKey, PersistedFlow>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a digest received at collector time `now` (µs).
    ///
    /// Counters never move backwards: a digest with a lower packet or byte
    /// count than the stored instance is rejected, and an exact repeat is
    /// dropped as a duplicate. A zero byte count means the switch is not
    /// counting bytes; it neither regresses nor updates the stored value.
    /// An expired instance is replaced by a fresh one without the guard.
    pub fn upsert(&self, switch_id: &str, digest: &DigestMessage, now: u64) -> UpsertOutcome {
        match self.flows.entry((switch_id.to_string(), digest.flow_id)) {
            Entry::Vacant(vacant) => {
                let flow = PersistedFlow::from_digest(switch_id, digest, now);
                vacant.insert(flow.clone());
                UpsertOutcome::Created(flow)
            }
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();

                if stored.status == FlowStatus::Expired {
                    *stored = PersistedFlow::from_digest(switch_id, digest, now);
                    return UpsertOutcome::Restarted(stored.clone());
                }

                if digest.packet_count < stored.packet_count {
                    return UpsertOutcome::Regression {
                        counter: Counter::Packets,
                        stored: stored.packet_count,
                        incoming: digest.packet_count,
                    };
                }

                let bytes_reported = digest.byte_count != 0;
                if bytes_reported && digest.byte_count < stored.byte_count {
                    return UpsertOutcome::Regression {
                        counter: Counter::Bytes,
                        stored: stored.byte_count,
                        incoming: digest.byte_count,
                    };
                }

                if digest.packet_count == stored.packet_count
                    && (!bytes_reported || digest.byte_count == stored.byte_count)
                {
                    return UpsertOutcome::Duplicate;
                }

                stored.apply_digest(digest, now);
                UpsertOutcome::Updated(stored.clone())
            }
        }
    }

    /// Marks every active flow idle for at least `timeout` as expired and
    /// returns the expired snapshots.
    ///
    /// A flow whose `last_seen` is exactly `timeout` old expires.
    pub fn sweep_expired(&self, now: u64, timeout: Duration) -> Vec<PersistedFlow> {
        let timeout_micros = duration_micros(timeout);
        let mut expired = Vec::new();

        for mut entry in self.flows.iter_mut() {
            let flow = entry.value_mut();
            if flow.is_active() && now.saturating_sub(flow.last_seen) >= timeout_micros {
                flow.expire(now);
                expired.push(flow.clone());
            }
        }

        expired
    }

    /// Removes expired instances older than `retention` and returns their
    /// instance ids.
    pub fn purge_expired(&self, now: u64, retention: Duration) -> Vec<Uuid> {
        let retention_micros = duration_micros(retention);
        let mut purged = Vec::new();

        self.flows.retain(|_, flow| {
            let stale = match (flow.status, flow.expired_at) {
                (FlowStatus::Expired, Some(at)) => now.saturating_sub(at) >= retention_micros,
                _ => false,
            };
            if stale {
                purged.push(flow.instance_id);
            }
            !stale
        });

        purged
    }

    /// Looks up one flow.
    pub fn get(&self, switch_id: &str, flow_id: FlowId) -> Option<PersistedFlow> {
        self.flows
            .get(&(switch_id.to_string(), flow_id))
            .map(|f| f.value().clone())
    }

    /// Snapshot of all flows, optionally limited to active ones.
    pub fn snapshot(&self, active_only: bool) -> Vec<PersistedFlow> {
        self.flows
            .iter()
            .filter(|f| !active_only || f.is_active())
            .map(|f| f.value().clone())
            .collect()
    }

    /// Number of active flows.
    pub fn active_count(&self) -> usize {
        self.flows.iter().filter(|f| f.is_active()).count()
    }

    /// Number of tracked instances, active or expired.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

fn duration_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

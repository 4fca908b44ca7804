//! Fixed-capacity flow state tables.
//!
//! Two layouts are provided behind the [`FlowTable`] trait:
//!
//! - [`DirectFlowTable`]: one slot per flow id. Keys that hash to the same
//!   id share a slot and their counters merge. This is the default.
//! - [`ChainedFlowTable`]: one bounded bucket per flow id holding up to
//!   `bucket_depth` distinct keys. A full bucket evicts its least recently
//!   updated entry.
//!
//! Both tables allocate all storage up front and never resize. Updates to
//! one slot or bucket are serialized by its own lock; different slots are
//! independent.

use crate::error::{DataplaneError, Result};
use flowtel_common::{FlowId, FlowKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of one flow's counters.
///
/// `packet_count == 0` means the slot has never been written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowRecord {
    pub flow_id: FlowId,
    pub packet_count: u32,
    pub byte_count: u32,
    /// First packet time in microseconds.
    pub first_seen: u64,
    /// Last packet time in microseconds.
    pub last_seen: u64,
}

impl FlowRecord {
    /// Returns true if no packet has been recorded.
    pub fn is_empty(&self) -> bool {
        self.packet_count == 0
    }

    /// Flow lifetime in microseconds.
    pub fn duration_micros(&self) -> u64 {
        self.last_seen.saturating_sub(self.first_seen)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    packet_count: u32,
    byte_count: u32,
    first_seen: u64,
    last_seen: u64,
}

impl Counters {
    /// Read-modify-write for one packet. Counters saturate at the register
    /// width so they never decrease.
    fn apply(&mut self, timestamp: u64, size: u32) {
        if self.packet_count == 0 {
            self.first_seen = timestamp;
        }
        self.packet_count = self.packet_count.saturating_add(1);
        self.byte_count = self.byte_count.saturating_add(size);
        self.last_seen = timestamp;
    }

    fn record(&self, flow_id: FlowId) -> FlowRecord {
        FlowRecord {
            flow_id,
            packet_count: self.packet_count,
            byte_count: self.byte_count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Per-switch flow state store.
pub trait FlowTable: Send + Sync {
    /// Applies one packet to the flow's state and returns the post-update
    /// snapshot.
    fn record_packet(&self, key: &FlowKey, flow_id: FlowId, timestamp: u64, size: u32)
        -> FlowRecord;

    /// Returns the current state for a flow without modifying it.
    fn snapshot(&self, key: &FlowKey, flow_id: FlowId) -> FlowRecord;

    /// Number of slots.
    fn capacity(&self) -> u32;

    /// Number of slots or entries currently holding state.
    fn occupied(&self) -> usize;
}

/// Table layout selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableKind {
    /// Collision-merging direct-indexed table.
    #[default]
    Direct,
    /// Bounded per-slot chaining.
    Chained { bucket_depth: usize },
}

/// Builds a table of the given layout.
pub fn build_table(kind: TableKind, capacity: u32) -> Result<Box<dyn FlowTable>> {
    match kind {
        TableKind::Direct => Ok(Box::new(DirectFlowTable::new(capacity)?)),
        TableKind::Chained { bucket_depth } => {
            Ok(Box::new(ChainedFlowTable::new(capacity, bucket_depth)?))
        }
    }
}

/// Direct-indexed table: slot `i` holds the merged state of every key
/// whose flow id is `i`.
pub struct DirectFlowTable {
    slots: Box<[Mutex<Counters>]>,
}

impl DirectFlowTable {
    /// Preallocates `capacity` empty slots.
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(DataplaneError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity)
            .map(|_| Mutex::new(Counters::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self { slots })
    }

    fn slot(&self, flow_id: FlowId) -> &Mutex<Counters> {
        // Ids minted for a larger table wrap instead of indexing out of range.
        &self.slots[flow_id.index() % self.slots.len()]
    }
}

impl FlowTable for DirectFlowTable {
    fn record_packet(
        &self,
        _key: &FlowKey,
        flow_id: FlowId,
        timestamp: u64,
        size: u32,
    ) -> FlowRecord {
        let mut counters = self.slot(flow_id).lock();
        counters.apply(timestamp, size);
        counters.record(flow_id)
    }

    fn snapshot(&self, _key: &FlowKey, flow_id: FlowId) -> FlowRecord {
        self.slot(flow_id).lock().record(flow_id)
    }

    fn capacity(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().packet_count > 0)
            .count()
    }
}

/// Bucketed table that keeps colliding keys apart.
pub struct ChainedFlowTable {
    buckets: Box<[Mutex<Vec<(FlowKey, Counters)>>]>,
    bucket_depth: usize,
    evictions: AtomicU64,
}

impl ChainedFlowTable {
    /// Preallocates `capacity` buckets of `bucket_depth` entries each.
    pub fn new(capacity: u32, bucket_depth: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DataplaneError::InvalidCapacity(capacity));
        }
        if bucket_depth == 0 {
            return Err(DataplaneError::InvalidBucketDepth(bucket_depth));
        }
        let buckets = (0..capacity)
            .map(|_| Mutex::new(Vec::with_capacity(bucket_depth)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            buckets,
            bucket_depth,
            evictions: AtomicU64::new(0),
        })
    }

    /// Number of entries evicted from full buckets.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn bucket(&self, flow_id: FlowId) -> &Mutex<Vec<(FlowKey, Counters)>> {
        &self.buckets[flow_id.index() % self.buckets.len()]
    }
}

impl FlowTable for ChainedFlowTable {
    fn record_packet(
        &self,
        key: &FlowKey,
        flow_id: FlowId,
        timestamp: u64,
        size: u32,
    ) -> FlowRecord {
        let mut bucket = self.bucket(flow_id).lock();

        if let Some(entry) = bucket.iter_mut().find(|entry| entry.0 == *key) {
            entry.1.apply(timestamp, size);
            return entry.1.record(flow_id);
        }

        let mut counters = Counters::default();
        counters.apply(timestamp, size);

        if bucket.len() < self.bucket_depth {
            bucket.push((*key, counters));
        } else if let Some(victim) = bucket.iter_mut().min_by_key(|entry| entry.1.last_seen) {
            *victim = (*key, counters);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        counters.record(flow_id)
    }

    fn snapshot(&self, key: &FlowKey, flow_id: FlowId) -> FlowRecord {
        self.bucket(flow_id)
            .lock()
            .iter()
            .find(|entry| entry.0 == *key)
            .map(|entry| entry.1.record(flow_id))
            .unwrap_or(FlowRecord {
                flow_id,
                ..Default::default()
            })
    }

    fn capacity(&self) -> u32 {
        u32::try_from(self.buckets.len()).unwrap_or(u32::MAX)
    }

    fn occupied(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_id::FlowIdentifier;
    use flowtel_common::IPPROTO_TCP;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::thread;

    fn key(src_port: u16) -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            IPPROTO_TCP,
            src_port,
            80,
        )
    }

    /// Finds two ports whose keys hash to the same id.
    fn colliding_pair(ident: &FlowIdentifier) -> (FlowKey, FlowKey) {
        let first = key(1000);
        let target = ident.identify(&first);
        let second = (1001..u16::MAX)
            .map(key)
            .find(|k| ident.identify(k) == target)
            .expect("collision within port range");
        (first, second)
    }

    #[test]
    fn test_direct_first_packet_sets_first_seen() {
        let table = DirectFlowTable::new(16).unwrap();
        let rec = table.record_packet(&key(1), FlowId(3), 1_000, 100);
        assert_eq!(
            rec,
            FlowRecord {
                flow_id: FlowId(3),
                packet_count: 1,
                byte_count: 100,
                first_seen: 1_000,
                last_seen: 1_000,
            }
        );

        let rec = table.record_packet(&key(1), FlowId(3), 5_000, 60);
        assert_eq!(rec.packet_count, 2);
        assert_eq!(rec.byte_count, 160);
        assert_eq!(rec.first_seen, 1_000);
        assert_eq!(rec.last_seen, 5_000);
        assert_eq!(rec.duration_micros(), 4_000);
    }

    #[test]
    fn test_direct_zero_capacity_rejected() {
        assert!(DirectFlowTable::new(0).is_err());
    }

    #[test]
    fn test_direct_collision_merges_counters() {
        let ident = FlowIdentifier::new(8).unwrap();
        let table = DirectFlowTable::new(8).unwrap();
        let (a, b) = colliding_pair(&ident);
        let id = ident.identify(&a);

        table.record_packet(&a, id, 10, 100);
        table.record_packet(&a, id, 20, 100);
        let rec = table.record_packet(&b, id, 30, 50);

        assert_eq!(rec.packet_count, 3);
        assert_eq!(rec.byte_count, 250);
        assert_eq!(rec.first_seen, 10);
        assert_eq!(table.occupied(), 1);
    }

    #[test]
    fn test_direct_counters_saturate() {
        let table = DirectFlowTable::new(1).unwrap();
        table.record_packet(&key(1), FlowId(0), 1, u32::MAX);
        let rec = table.record_packet(&key(1), FlowId(0), 2, 10);
        assert_eq!(rec.byte_count, u32::MAX);
        assert_eq!(rec.packet_count, 2);
    }

    #[test]
    fn test_direct_replay_is_pure() {
        let ident = FlowIdentifier::new(64).unwrap();
        let packets: Vec<(FlowKey, u64, u32)> = (0..200u16)
            .map(|i| (key(i % 17), u64::from(i) * 10, 64 + u32::from(i)))
            .collect();

        let run = || {
            let table = DirectFlowTable::new(64).unwrap();
            let outputs: Vec<FlowRecord> = packets
                .iter()
                .map(|(k, ts, size)| table.record_packet(k, ident.identify(k), *ts, *size))
                .collect();
            let finals: Vec<FlowRecord> = (0..64)
                .map(|i| table.snapshot(&key(0), FlowId(i)))
                .collect();
            (outputs, finals)
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_direct_concurrent_updates_same_slot() {
        let table = Arc::new(DirectFlowTable::new(4).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..1_000u64 {
                        table.record_packet(&key(t), FlowId(1), i, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let rec = table.snapshot(&key(0), FlowId(1));
        assert_eq!(rec.packet_count, 8_000);
        assert_eq!(rec.byte_count, 8_000);
    }

    #[test]
    fn test_chained_keeps_colliding_keys_apart() {
        let ident = FlowIdentifier::new(8).unwrap();
        let table = ChainedFlowTable::new(8, 4).unwrap();
        let (a, b) = colliding_pair(&ident);
        let id = ident.identify(&a);

        table.record_packet(&a, id, 10, 100);
        table.record_packet(&a, id, 20, 100);
        let rec_b = table.record_packet(&b, id, 30, 50);

        assert_eq!(rec_b.packet_count, 1);
        assert_eq!(rec_b.byte_count, 50);
        assert_eq!(table.snapshot(&a, id).packet_count, 2);
        assert_eq!(table.occupied(), 2);
    }

    #[test]
    fn test_chained_evicts_oldest_when_full() {
        let table = ChainedFlowTable::new(1, 2).unwrap();
        table.record_packet(&key(1), FlowId(0), 100, 1);
        table.record_packet(&key(2), FlowId(0), 200, 1);
        table.record_packet(&key(1), FlowId(0), 300, 1);

        table.record_packet(&key(3), FlowId(0), 400, 1);

        assert_eq!(table.evictions(), 1);
        assert_eq!(table.occupied(), 2);
        assert!(table.snapshot(&key(2), FlowId(0)).is_empty());
        assert_eq!(table.snapshot(&key(1), FlowId(0)).packet_count, 2);
        assert_eq!(table.snapshot(&key(3), FlowId(0)).packet_count, 1);
    }

    #[test]
    fn test_chained_rejects_zero_depth() {
        assert!(matches!(
            ChainedFlowTable::new(4, 0),
            Err(DataplaneError::InvalidBucketDepth(0))
        ));
    }

    #[test]
    fn test_build_table() {
        let direct = build_table(TableKind::Direct, 32).unwrap();
        assert_eq!(direct.capacity(), 32);
        let chained = build_table(TableKind::Chained { bucket_depth: 2 }, 16).unwrap();
        assert_eq!(chained.capacity(), 16);
        assert_eq!(chained.occupied(), 0);
    }
}

//! Aggregate views over the flow registry.

use chrono::{DateTime, Utc};
use flowtel_common::{protocol_name, FlowKey, PersistedFlow};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Collector-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStatistics {
    pub active_flows: usize,
    pub expired_flows: usize,
    pub total_packets: u64,
    pub total_bytes: u64,
    /// Distinct switches with at least one active flow.
    pub switches_reporting: usize,
    pub last_update: DateTime<Utc>,
}

/// Share of active flows using one protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolShare {
    pub protocol: String,
    pub flows: usize,
    pub percentage: f64,
}

/// Entry in the top-flows listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopFlow {
    pub switch_id: String,
    pub key: FlowKey,
    pub packet_count: u32,
    pub byte_count: u32,
    pub duration_secs: f64,
}

/// Totals over active flows; expired instances only count towards
/// `expired_flows`.
pub fn summarize(flows: &[PersistedFlow]) -> CollectorStatistics {
    let mut stats = CollectorStatistics {
        active_flows: 0,
        expired_flows: 0,
        total_packets: 0,
        total_bytes: 0,
        switches_reporting: 0,
        last_update: Utc::now(),
    };
    let mut switches = HashSet::new();

    for flow in flows {
        if flow.is_active() {
            stats.active_flows += 1;
            stats.total_packets += u64::from(flow.packet_count);
            stats.total_bytes += u64::from(flow.byte_count);
            switches.insert(flow.switch_id.as_str());
        } else {
            stats.expired_flows += 1;
        }
    }
    stats.switches_reporting = switches.len();
    stats
}

/// Protocol mix of active flows, largest first.
pub fn protocol_distribution(flows: &[PersistedFlow]) -> Vec<ProtocolShare> {
    let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
    let mut total = 0usize;
    for flow in flows.iter().filter(|f| f.is_active()) {
        *counts.entry(flow.key.protocol).or_default() += 1;
        total += 1;
    }

    let mut shares: Vec<ProtocolShare> = counts
        .into_iter()
        .map(|(protocol, flows)| ProtocolShare {
            protocol: protocol_name(protocol),
            flows,
            percentage: if total == 0 {
                0.0
            } else {
                (flows as f64 / total as f64 * 10_000.0).round() / 100.0
            },
        })
        .collect();
    shares.sort_by(|a, b| b.flows.cmp(&a.flows).then_with(|| a.protocol.cmp(&b.protocol)));
    shares
}

/// Active flows with the most bytes.
pub fn top_flows(flows: &[PersistedFlow], limit: usize) -> Vec<TopFlow> {
    let mut active: Vec<&PersistedFlow> = flows.iter().filter(|f| f.is_active()).collect();
    active.sort_by(|a, b| b.byte_count.cmp(&a.byte_count));
    active
        .into_iter()
        .take(limit)
        .map(|f| TopFlow {
            switch_id: f.switch_id.clone(),
            key: f.key,
            packet_count: f.packet_count,
            byte_count: f.byte_count,
            duration_secs: f.switch_duration_micros() as f64 / 1_000_000.0,
        })
        .collect()
}

//! Threshold alerts on reconciled flows.
//!
//! Three conditions are evaluated whenever a digest is applied:
//!
//! - high bandwidth: average bytes per second over the flow's lifetime
//! - long flow: flow lifetime in seconds
//! - port scan: distinct destination ports opened by one source within
//!   [`PORT_SCAN_WINDOW`]
//!
//! Flow alerts fire at most once per flow instance; a port scan alert at
//! most once per source and window. Raised alerts are kept in a bounded
//! ring for queries.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use flowtel_common::{AlertThresholds, FlowId, PersistedFlow};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Period over which distinct destination ports of one source are counted.
pub const PORT_SCAN_WINDOW: Duration = Duration::from_secs(60);

const PORT_SCAN_WINDOW_MICROS: u64 = PORT_SCAN_WINDOW.as_micros() as u64;

/// Ports opened by one source in the current window.
#[derive(Debug)]
struct ScanWindow {
    started: u64,
    ports: HashSet<u16>,
    fired: bool,
}

impl ScanWindow {
    fn new(started: u64) -> Self {
        Self {
            started,
            ports: HashSet::new(),
            fired: false,
        }
    }

    fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.started) >= PORT_SCAN_WINDOW_MICROS
    }
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Alert conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighBandwidth,
    LongFlow,
    PortScan,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::HighBandwidth => write!(f, "high_bandwidth"),
            AlertKind::LongFlow => write!(f, "long_flow"),
            AlertKind::PortScan => write!(f, "port_scan"),
        }
    }
}

/// A raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct FlowAlert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub switch_id: String,
    pub flow_id: Option<FlowId>,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Evaluates thresholds and keeps recent alerts.
pub struct FlowAlertEvaluator {
    fired: DashSet<(Uuid, AlertKind)>,
    scans: DashMap<(String, Ipv4Addr), ScanWindow>,
    recent: Mutex<VecDeque<FlowAlert>>,
    history: usize,
}

impl FlowAlertEvaluator {
    /// Creates an evaluator keeping up to `history` recent alerts.
    pub fn new(history: usize) -> Self {
        Self {
            fired: DashSet::new(),
            scans: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(history.min(1024))),
            history: history.max(1),
        }
    }

    /// Evaluates an applied snapshot. `new_instance` is true when the
    /// digest created the instance.
    pub fn evaluate(
        &self,
        flow: &PersistedFlow,
        new_instance: bool,
        thresholds: &AlertThresholds,
    ) -> Vec<FlowAlert> {
        let mut raised = Vec::new();
        let duration_micros = flow.switch_duration_micros();
        let duration_secs = duration_micros as f64 / 1_000_000.0;

        if duration_secs >= 1.0 {
            let bps = f64::from(flow.byte_count) / duration_secs;
            if bps > thresholds.high_bandwidth_bps as f64
                && self.fired.insert((flow.instance_id, AlertKind::HighBandwidth))
            {
                raised.push(self.flow_alert(
                    flow,
                    AlertKind::HighBandwidth,
                    AlertSeverity::Warning,
                    format!("High bandwidth flow {} ({:.0} B/s)", flow.key, bps),
                    json!({
                        "threshold": thresholds.high_bandwidth_bps,
                        "current": bps.round() as u64,
                    }),
                ));
            }
        }

        if duration_micros / 1_000_000 >= thresholds.long_flow_secs
            && self.fired.insert((flow.instance_id, AlertKind::LongFlow))
        {
            raised.push(self.flow_alert(
                flow,
                AlertKind::LongFlow,
                AlertSeverity::Info,
                format!("Long-lived flow {} ({:.0}s)", flow.key, duration_secs),
                json!({
                    "threshold": thresholds.long_flow_secs,
                    "current": duration_micros / 1_000_000,
                }),
            ));
        }

        if new_instance {
            if let Some(alert) = self.track_port_scan(flow, thresholds.port_scan_ports) {
                raised.push(alert);
            }
        }

        for alert in &raised {
            warn!(
                kind = %alert.kind,
                severity = %alert.severity,
                switch_id = %alert.switch_id,
                "{}",
                alert.message
            );
            self.remember(alert.clone());
        }

        raised
    }

    /// Counts the flow's destination port against its source's window,
    /// keyed on the collector time of the flow's first digest.
    fn track_port_scan(&self, flow: &PersistedFlow, threshold: usize) -> Option<FlowAlert> {
        let now = flow.first_seen;
        let distinct = {
            let mut window = self
                .scans
                .entry((flow.switch_id.clone(), flow.key.src_addr))
                .or_insert_with(|| ScanWindow::new(now));
            if window.is_stale(now) {
                *window = ScanWindow::new(now);
            }
            if window.fired {
                return None;
            }
            window.ports.insert(flow.key.dst_port);
            let distinct = window.ports.len();
            if distinct <= threshold {
                return None;
            }
            window.fired = true;
            window.ports = HashSet::new();
            distinct
        };

        Some(FlowAlert {
            id: Uuid::new_v4(),
            kind: AlertKind::PortScan,
            severity: AlertSeverity::Critical,
            switch_id: flow.switch_id.clone(),
            flow_id: None,
            message: format!(
                "Possible port scan from {} ({} destination ports in {}s)",
                flow.key.src_addr,
                distinct,
                PORT_SCAN_WINDOW.as_secs()
            ),
            details: json!({
                "threshold": threshold,
                "current": distinct,
                "window_secs": PORT_SCAN_WINDOW.as_secs(),
            }),
            created_at: Utc::now(),
            acknowledged: false,
        })
    }

    fn flow_alert(
        &self,
        flow: &PersistedFlow,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        details: serde_json::Value,
    ) -> FlowAlert {
        FlowAlert {
            id: Uuid::new_v4(),
            kind,
            severity,
            switch_id: flow.switch_id.clone(),
            flow_id: Some(flow.flow_id),
            message,
            details,
            created_at: Utc::now(),
            acknowledged: false,
        }
    }

    fn remember(&self, alert: FlowAlert) {
        let mut recent = self.recent.lock();
        if recent.len() == self.history {
            recent.pop_front();
        }
        recent.push_back(alert);
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<FlowAlert> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Marks an alert acknowledged. Returns false if it is not retained.
    pub fn acknowledge(&self, id: Uuid) -> bool {
        let mut recent = self.recent.lock();
        match recent.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Drops per-instance state for purged flow instances.
    pub fn forget_instances(&self, instances: &[Uuid]) {
        if instances.is_empty() {
            return;
        }
        let purged: HashSet<&Uuid> = instances.iter().collect();
        self.fired.retain(|(id, _)| !purged.contains(id));
    }

    /// Drops port scan windows that ended before collector time `now` (µs).
    /// Returns the number of sources dropped.
    pub fn prune_scans(&self, now: u64) -> usize {
        let before = self.scans.len();
        self.scans.retain(|_, window| !window.is_stale(now));
        let pruned = before.saturating_sub(self.scans.len());
        if pruned > 0 {
            debug!(pruned, "Port scan windows pruned");
        }
        pruned
    }

    /// Sources with an open port scan window.
    pub fn tracked_sources(&self) -> usize {
        self.scans.len()
    }
}

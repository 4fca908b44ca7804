//! Digest consumer.
//!
//! Receives digests from every switch session, reconciles them into the
//! [`FlowRegistry`], batches accepted snapshots through the
//! [`FlushBuffer`] and ages out idle flows with a periodic sweep.
//!
//! Tasks:
//! - one ingestion task per attached switch session, fed either by an
//!   in-process channel or by frames queued with [`DigestConsumer::enqueue_frame`]
//! - one background flusher
//! - one expiry sweeper
//!
//! None of the background tasks hold a lock that ingestion needs; per-flow
//! updates only contend on their own registry shard.

use crate::alerts::{FlowAlert, FlowAlertEvaluator};
use crate::config::CollectorConfig;
use crate::error::{CollectorError, Result};
use crate::flush_buffer::FlushBuffer;
use crate::health::HealthMonitor;
use crate::metrics::{HealthStatus, MetricsCollector};
use crate::registry::{FlowRegistry, UpsertOutcome};
use crate::statistics::{self, CollectorStatistics, ProtocolShare, TopFlow};
use dashmap::DashMap;
use flowtel_common::{
    now_micros, DigestFrame, DigestMessage, Feature, FlowId, FlowStore, PersistedFlow,
    PolicyConfig,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Control-plane digest consumer.
pub struct DigestConsumer {
    config: CollectorConfig,
    policy: RwLock<PolicyConfig>,
    registry: FlowRegistry,
    buffer: Arc<FlushBuffer>,
    alerts: FlowAlertEvaluator,
    metrics: MetricsCollector,
    sessions: DashMap<String, (u64, CancellationToken)>,
    ingress: DashMap<String, mpsc::Sender<DigestFrame>>,
    session_seq: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DigestConsumer {
    /// Creates a consumer writing to `store`.
    pub fn new(
        config: CollectorConfig,
        policy: PolicyConfig,
        store: Arc<dyn FlowStore>,
        metrics: MetricsCollector,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        policy
            .validate()
            .map_err(|e| CollectorError::invalid_config("policy", e.to_string()))?;

        let health = HealthMonitor::new(
            metrics.clone(),
            config.max_flush_stall,
            config.max_flush_failure_rate,
        );
        let buffer = Arc::new(FlushBuffer::new(
            store,
            config.buffer_capacity,
            config.batch_size,
            metrics.clone(),
            health,
        ));

        Ok(Arc::new(Self {
            alerts: FlowAlertEvaluator::new(config.alert_history),
            config,
            policy: RwLock::new(policy),
            registry: FlowRegistry::new(),
            buffer,
            metrics,
            sessions: DashMap::new(),
            ingress: DashMap::new(),
            session_seq: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }))
    }

    /// Starts the background flusher and expiry sweeper.
    pub fn start(self: &Arc<Self>) {
        let buffer = Arc::clone(&self.buffer);
        self.tasks.spawn(buffer.run(self.config.flush_interval, self.cancel.child_token()));

        let consumer = Arc::clone(self);
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(consumer.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        consumer.sweep_at(now_micros()).await;
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        });

        info!(
            batch_size = self.config.batch_size,
            buffer_capacity = self.config.buffer_capacity,
            "Digest consumer started"
        );
    }

    /// Spawns an ingestion task for one switch session.
    ///
    /// Re-attaching a switch stops its previous ingestion task.
    pub fn attach(self: &Arc<Self>, switch_id: impl Into<String>, mut rx: mpsc::Receiver<DigestFrame>) {
        let switch_id = switch_id.into();
        let session_cancel = self.cancel.child_token();
        let generation = self.session_seq.fetch_add(1, Ordering::Relaxed);
        self.ingress.remove(&switch_id);
        if let Some((_, previous)) = self
            .sessions
            .insert(switch_id.clone(), (generation, session_cancel.clone()))
        {
            previous.cancel();
        }

        let consumer = Arc::clone(self);
        self.tasks.spawn(async move {
            info!(switch_id = %switch_id, "Digest session attached");
            loop {
                tokio::select! {
                    _ = session_cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            // Malformed frames are counted and logged inside.
                            let _ = consumer.ingest_frame(&switch_id, &frame).await;
                        }
                        None => break,
                    }
                }
            }
            consumer
                .sessions
                .remove_if(&switch_id, |_, (current, _)| *current == generation);
            info!(switch_id = %switch_id, "Digest session detached");
        });
    }

    /// Queues a raw frame on the switch's ingestion session, attaching one
    /// on first use. Never waits: a full session queue rejects the frame,
    /// so a stalled session cannot hold up frames for other switches.
    pub fn enqueue_frame(self: &Arc<Self>, switch_id: &str, frame: DigestFrame) -> Result<()> {
        let tx = self.session_sender(switch_id);
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CollectorError::SessionBacklog {
                switch_id: switch_id.to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => CollectorError::SessionClosed {
                switch_id: switch_id.to_string(),
            },
        })
    }

    fn session_sender(self: &Arc<Self>, switch_id: &str) -> mpsc::Sender<DigestFrame> {
        if let Some(tx) = self.ingress.get(switch_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(self.config.ingest_channel_capacity);
        self.attach(switch_id, rx);
        self.ingress.insert(switch_id.to_string(), tx.clone());
        tx
    }

    /// Stops the ingestion task of a switch session.
    pub fn detach(&self, switch_id: &str) {
        self.ingress.remove(switch_id);
        if let Some((_, (_, token))) = self.sessions.remove(switch_id) {
            token.cancel();
        }
    }

    /// Number of attached ingestion sessions.
    pub fn attached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Decodes and applies one frame.
    pub async fn ingest_frame(&self, switch_id: &str, frame: &[u8]) -> Result<UpsertOutcome> {
        self.metrics.digests_received_total.inc();
        let digest = match DigestMessage::decode(frame) {
            Ok(d) => d,
            Err(e) => {
                self.metrics.digests_malformed_total.inc();
                warn!(switch_id = %switch_id, error = %e, "Malformed digest dropped");
                return Err(e.into());
            }
        };
        Ok(self.apply(switch_id, &digest, now_micros()).await)
    }

    /// Applies one digest at the current collector time.
    pub async fn ingest(&self, switch_id: &str, digest: &DigestMessage) -> UpsertOutcome {
        self.ingest_at(switch_id, digest, now_micros()).await
    }

    /// Applies one digest at collector time `now` (µs).
    pub async fn ingest_at(&self, switch_id: &str, digest: &DigestMessage, now: u64) -> UpsertOutcome {
        self.metrics.digests_received_total.inc();
        self.apply(switch_id, digest, now).await
    }

    async fn apply(&self, switch_id: &str, digest: &DigestMessage, now: u64) -> UpsertOutcome {
        let outcome = self.registry.upsert(switch_id, digest, now);

        match &outcome {
            UpsertOutcome::Created(flow)
            | UpsertOutcome::Restarted(flow)
            | UpsertOutcome::Updated(flow) => {
                self.metrics.digests_applied_total.inc();
                if outcome.is_new_instance() {
                    self.metrics.flows_created_total.inc();
                    debug!(
                        switch_id = %switch_id,
                        flow_id = %flow.flow_id,
                        key = %flow.key,
                        "Flow instance started"
                    );
                }

                let thresholds = self.policy.read().thresholds.clone();
                let raised = self.alerts.evaluate(flow, outcome.is_new_instance(), &thresholds);
                if !raised.is_empty() {
                    self.metrics.alerts_total.inc_by(raised.len() as f64);
                }

                self.buffer.push(flow.clone()).await;
            }
            UpsertOutcome::Regression {
                counter,
                stored,
                incoming,
            } => {
                self.metrics.digests_regressed_total.inc();
                debug!(
                    switch_id = %switch_id,
                    flow_id = %digest.flow_id,
                    %counter,
                    stored,
                    incoming,
                    "Out-of-order digest dropped"
                );
            }
            UpsertOutcome::Duplicate => {
                self.metrics.digests_duplicate_total.inc();
            }
        }

        outcome
    }

    /// Runs one expiry pass at collector time `now` (µs). Returns the number
    /// of flows expired.
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: u64) -> usize {
        let timeout = self.policy.read().flow_timeout();
        let expired = self.registry.sweep_expired(now, timeout);
        let count = expired.len();

        for flow in expired {
            self.metrics.flows_expired_total.inc();
            self.buffer.push(flow).await;
        }

        let purged = self
            .registry
            .purge_expired(now, self.config.tombstone_retention);
        self.alerts.forget_instances(&purged);
        self.alerts.prune_scans(now);

        self.metrics.set_active_flows(self.registry.active_count());
        if count > 0 || !purged.is_empty() {
            info!(expired = count, purged = purged.len(), "Expiry sweep completed");
        }
        count
    }

    /// Flushes everything buffered.
    pub async fn flush(&self) -> Result<usize> {
        self.buffer
            .flush_all()
            .await
            .map_err(|e| CollectorError::store("append_flow_batch", e))
    }

    /// Validates and installs a new policy. The previous policy stays in
    /// force on error.
    pub fn apply_policy(&self, policy: &PolicyConfig) -> Result<()> {
        policy
            .validate()
            .map_err(|e| CollectorError::invalid_config("policy", e.to_string()))?;
        *self.policy.write() = policy.clone();
        info!(
            flow_timeout_secs = policy.flow_timeout_secs,
            "Collector policy updated"
        );
        Ok(())
    }

    /// Policy in force.
    pub fn policy(&self) -> PolicyConfig {
        self.policy.read().clone()
    }

    /// Collector-wide totals.
    pub fn statistics(&self) -> CollectorStatistics {
        statistics::summarize(&self.registry.snapshot(false))
    }

    /// Protocol mix of active flows. Empty unless protocol analysis is
    /// enabled.
    pub fn protocol_distribution(&self) -> Vec<ProtocolShare> {
        if !self.policy.read().has_feature(Feature::ProtocolAnalysis) {
            return Vec::new();
        }
        statistics::protocol_distribution(&self.registry.snapshot(true))
    }

    /// Active flows with the most bytes.
    pub fn top_flows(&self, limit: usize) -> Vec<TopFlow> {
        statistics::top_flows(&self.registry.snapshot(true), limit)
    }

    /// Up to `limit` flows, most recently seen first.
    pub fn flows(&self, limit: usize, active_only: bool) -> Vec<PersistedFlow> {
        let mut flows = self.registry.snapshot(active_only);
        flows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        flows.truncate(limit);
        flows
    }

    /// Looks up one flow.
    pub fn flow(&self, switch_id: &str, flow_id: FlowId) -> Option<PersistedFlow> {
        self.registry.get(switch_id, flow_id)
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<FlowAlert> {
        self.alerts.recent(limit)
    }

    /// Acknowledges a retained alert.
    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        self.alerts.acknowledge(id)
    }

    /// Health of the flush path.
    pub fn health_status(&self) -> HealthStatus {
        self.buffer.health_status()
    }

    pub fn buffer(&self) -> &FlushBuffer {
        &self.buffer
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Stops ingestion and background tasks, then drains the buffer.
    pub async fn shutdown(&self) {
        info!("Digest consumer shutting down");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.buffer.drain().await;
        info!(
            flushed = self.buffer.stats().flushed(),
            dropped = self.buffer.stats().dropped(),
            "Digest consumer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtel_common::{FlowKey, FlowStatus, MemoryFlowStore, IPPROTO_TCP};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const SEC: u64 = 1_000_000;

    fn digest(packets: u32) -> DigestMessage {
        DigestMessage {
            flow_id: FlowId(5),
            key: FlowKey::new(
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                IPPROTO_TCP,
                3333,
                80,
            ),
            packet_count: packets,
            byte_count: packets * 64,
            timestamp: u64::from(packets),
            flow_duration_ms: 0,
            packet_size: 64,
        }
    }

    fn consumer(store: Arc<MemoryFlowStore>, batch_size: usize) -> Arc<DigestConsumer> {
        let config = CollectorConfig {
            batch_size,
            buffer_capacity: 64,
            ..Default::default()
        };
        DigestConsumer::new(
            config,
            PolicyConfig::default(),
            store,
            MetricsCollector::new().unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_regression_not_persisted() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store.clone(), 1);
        c.ingest_at("s1", &digest(5), SEC).await;
        c.ingest_at("s1", &digest(3), SEC).await;
        c.ingest_at("s1", &digest(8), SEC).await;
        c.flush().await.unwrap();

        let counts: Vec<u32> = store.records().iter().map(|r| r.packet_count).collect();
        assert_eq!(counts, vec![5, 8]);
        assert_eq!(c.metrics().digests_regressed_total.get(), 1.0);
        assert_eq!(c.metrics().digests_received_total.get(), 3.0);
    }

    #[tokio::test]
    async fn test_malformed_frame_counted() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store, 1);
        assert!(c.ingest_frame("s1", &[1, 2, 3]).await.is_err());
        assert_eq!(c.metrics().digests_malformed_total.get(), 1.0);
        assert!(c.registry().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_persists_expired_snapshot() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store.clone(), 1);
        c.ingest_at("s1", &digest(1), 0).await;

        assert_eq!(c.sweep_at(299 * SEC).await, 0);
        assert_eq!(c.sweep_at(300 * SEC).await, 1);
        c.flush().await.unwrap();

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, FlowStatus::Expired);
        assert_eq!(c.statistics().expired_flows, 1);
    }

    #[tokio::test]
    async fn test_policy_timeout_applies_to_sweep() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store, 1);
        c.ingest_at("s1", &digest(1), 0).await;

        let bad = PolicyConfig {
            flow_timeout_secs: 0,
            ..Default::default()
        };
        assert!(c.apply_policy(&bad).is_err());
        assert_eq!(c.policy().flow_timeout_secs, 300);

        let short = PolicyConfig {
            flow_timeout_secs: 10,
            ..Default::default()
        };
        c.apply_policy(&short).unwrap();
        assert_eq!(c.sweep_at(10 * SEC).await, 1);
    }

    #[tokio::test]
    async fn test_protocol_distribution_follows_feature() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store, 1);
        c.ingest_at("s1", &digest(1), 0).await;
        assert_eq!(c.protocol_distribution().len(), 1);

        let mut policy = PolicyConfig::default();
        policy.enabled_features.remove(&Feature::ProtocolAnalysis);
        c.apply_policy(&policy).unwrap();
        assert!(c.protocol_distribution().is_empty());
    }

    #[tokio::test]
    async fn test_attach_and_shutdown_drains() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store.clone(), 10);
        c.start();

        let (tx, rx) = mpsc::channel(16);
        c.attach("s1", rx);
        for packets in 1..=3 {
            tx.send(digest(packets).encode()).await.unwrap();
        }
        drop(tx);

        // Wait for the ingestion task to consume the closed channel.
        for _ in 0..100 {
            if c.registry().get("s1", FlowId(5)).map(|f| f.packet_count) == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        c.shutdown().await;
        assert_eq!(store.record_count(), 3);
    }

    /// Store whose appends wait until permits are released.
    struct GatedStore {
        gate: tokio::sync::Semaphore,
        waiting: std::sync::atomic::AtomicUsize,
    }

    impl GatedStore {
        fn closed() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                waiting: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl FlowStore for GatedStore {
        async fn append_flow_batch(
            &self,
            _records: &[PersistedFlow],
        ) -> std::result::Result<(), flowtel_common::StoreError> {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(())
        }
    }

    fn digest_for(flow_id: u32, packets: u32) -> DigestFrame {
        DigestMessage {
            flow_id: FlowId(flow_id),
            ..digest(packets)
        }
        .encode()
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_block_other_sessions() {
        let store = Arc::new(GatedStore::closed());
        let config = CollectorConfig {
            batch_size: 1,
            buffer_capacity: 1,
            ingest_channel_capacity: 2,
            ..Default::default()
        };
        let c = DigestConsumer::new(
            config,
            PolicyConfig::default(),
            store.clone(),
            MetricsCollector::new().unwrap(),
        )
        .unwrap();

        // The second frame forces a flush that blocks in the store.
        c.enqueue_frame("slow", digest_for(1, 1)).unwrap();
        c.enqueue_frame("slow", digest_for(1, 2)).unwrap();
        for _ in 0..200 {
            if store.waiting.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.waiting.load(Ordering::SeqCst), 1);

        c.enqueue_frame("slow", digest_for(1, 3)).unwrap();
        c.enqueue_frame("slow", digest_for(1, 4)).unwrap();
        assert!(matches!(
            c.enqueue_frame("slow", digest_for(1, 5)),
            Err(CollectorError::SessionBacklog { .. })
        ));

        c.enqueue_frame("fast", digest_for(2, 1)).unwrap();
        for _ in 0..200 {
            if c.flow("fast", FlowId(2)).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(c.flow("fast", FlowId(2)).map(|f| f.packet_count), Some(1));
        assert_eq!(c.flow("slow", FlowId(1)).map(|f| f.packet_count), Some(2));
        assert_eq!(c.attached_sessions(), 2);

        store.gate.add_permits(64);
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_after_detach_reattaches() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store, 1);
        c.enqueue_frame("s1", digest(1).encode()).unwrap();
        assert_eq!(c.attached_sessions(), 1);

        c.detach("s1");
        assert_eq!(c.attached_sessions(), 0);
        c.enqueue_frame("s1", digest(2).encode()).unwrap();
        assert_eq!(c.attached_sessions(), 1);

        for _ in 0..200 {
            if c.flow("s1", FlowId(5)).map(|f| f.packet_count) == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(c.flow("s1", FlowId(5)).map(|f| f.packet_count), Some(2));
        c.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_stops_session() {
        let store = Arc::new(MemoryFlowStore::new());
        let c = consumer(store, 1);
        let (_tx, rx) = mpsc::channel(4);
        c.attach("s1", rx);
        assert_eq!(c.attached_sessions(), 1);
        c.detach("s1");
        assert_eq!(c.attached_sessions(), 0);
        c.shutdown().await;
    }
}

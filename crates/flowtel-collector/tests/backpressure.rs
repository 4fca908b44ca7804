//! Flush buffer behaviour against slow and failing stores.

use async_trait::async_trait;
use flowtel_collector::{CollectorConfig, DigestConsumer, MetricsCollector};
use flowtel_common::{
    DigestMessage, FlowId, FlowKey, FlowStore, MemoryFlowStore, PersistedFlow, PolicyConfig,
    StoreError, IPPROTO_UDP,
};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

/// Store that takes a while to accept each batch.
struct SlowStore {
    delay: Duration,
    records: Mutex<Vec<PersistedFlow>>,
}

#[async_trait]
impl FlowStore for SlowStore {
    async fn append_flow_batch(&self, records: &[PersistedFlow]) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

fn digest(flow: u32) -> DigestMessage {
    DigestMessage {
        flow_id: FlowId(flow),
        key: FlowKey::new(
            Ipv4Addr::new(10, 1, 0, 1),
            Ipv4Addr::new(10, 1, 0, 2),
            IPPROTO_UDP,
            (1_000 + flow) as u16,
            4789,
        ),
        packet_count: 1,
        byte_count: 128,
        timestamp: u64::from(flow),
        flow_duration_ms: 0,
        packet_size: 128,
    }
}

fn small_buffer() -> CollectorConfig {
    CollectorConfig {
        batch_size: 4,
        buffer_capacity: 8,
        flush_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_slow_store_never_exceeds_capacity() {
    let store = Arc::new(SlowStore {
        delay: Duration::from_millis(5),
        records: Mutex::new(Vec::new()),
    });
    let consumer = DigestConsumer::new(
        small_buffer(),
        PolicyConfig::default(),
        store.clone(),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();
    consumer.start();

    for flow in 0..50 {
        consumer.ingest("leaf-1", &digest(flow)).await;
        assert!(consumer.buffer().len() <= 8);
    }
    consumer.shutdown().await;

    let stats = consumer.buffer().stats();
    assert!(stats.high_water() <= 8);
    assert_eq!(stats.dropped(), 0);
    assert_eq!(store.records.lock().len(), 50);
}

#[tokio::test]
async fn test_failing_store_drops_oldest_when_full() {
    let store = Arc::new(MemoryFlowStore::new());
    store.fail_next(usize::MAX);
    let consumer = DigestConsumer::new(
        small_buffer(),
        PolicyConfig::default(),
        store.clone(),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();

    for flow in 0..10 {
        consumer.ingest("leaf-1", &digest(flow)).await;
    }

    let buffer = consumer.buffer();
    assert_eq!(buffer.len(), 8);
    assert_eq!(buffer.stats().dropped(), 2);
    assert!(buffer.stats().failures() >= 2);
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let store = Arc::new(MemoryFlowStore::new());
    store.fail_next(1);
    let consumer = DigestConsumer::new(
        small_buffer(),
        PolicyConfig::default(),
        store.clone(),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();

    for flow in 0..3 {
        consumer.ingest("leaf-1", &digest(flow)).await;
    }
    assert!(consumer.flush().await.is_err());
    assert_eq!(consumer.buffer().len(), 3);

    assert_eq!(consumer.flush().await.unwrap(), 3);
    let flows: Vec<FlowId> = store.records().iter().map(|r| r.flow_id).collect();
    assert_eq!(flows, vec![FlowId(0), FlowId(1), FlowId(2)]);
}

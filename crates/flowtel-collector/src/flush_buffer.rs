//! Bounded write-behind buffer in front of the durable flow store.
//!
//! Records are appended on the ingestion path and drained in batches by a
//! background flusher, either when a full batch is waiting or when the
//! flush interval elapses. The buffer never holds more than `capacity`
//! records: pushing into a full buffer first flushes the oldest batch
//! synchronously. All store appends are serialized by one async lock, so
//! records reach the store in the order they were buffered.

use crate::health::HealthMonitor;
use crate::metrics::{HealthStatus, MetricsCollector};
use flowtel_common::{FlowStore, PersistedFlow, StoreError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Buffer counters.
#[derive(Debug, Default)]
pub struct FlushStats {
    flushed: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
    sync_flushes: AtomicU64,
    high_water: AtomicUsize,
}

impl FlushStats {
    /// Records written to the store.
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Failed store appends.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Records lost because the buffer could not hold them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes forced by a full buffer.
    pub fn sync_flushes(&self) -> u64 {
        self.sync_flushes.load(Ordering::Relaxed)
    }

    /// Highest resident record count observed.
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }
}

/// Bounded batching buffer.
pub struct FlushBuffer {
    queue: Mutex<VecDeque<PersistedFlow>>,
    capacity: usize,
    batch_size: usize,
    store: Arc<dyn FlowStore>,
    flush_lock: tokio::sync::Mutex<()>,
    notify: Notify,
    stats: FlushStats,
    metrics: MetricsCollector,
    health: Mutex<HealthMonitor>,
}

impl FlushBuffer {
    /// Creates a buffer over `store`.
    pub fn new(
        store: Arc<dyn FlowStore>,
        capacity: usize,
        batch_size: usize,
        metrics: MetricsCollector,
        health: HealthMonitor,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let capacity = capacity.max(batch_size);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            batch_size,
            store,
            flush_lock: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
            stats: FlushStats::default(),
            metrics,
            health: Mutex::new(health),
        }
    }

    /// Buffers one record, flushing the oldest batch first if the buffer
    /// is full.
    pub async fn push(&self, record: PersistedFlow) {
        let mut record = Some(record);

        // A successful forced flush always frees room; a failed one leaves
        // the buffer full, in which case the oldest record is dropped.
        for attempt in 0..2 {
            if let Some(len) = self.try_insert(&mut record) {
                if len >= self.batch_size {
                    self.notify.notify_one();
                }
                return;
            }

            if attempt == 0 {
                self.stats.sync_flushes.fetch_add(1, Ordering::Relaxed);
                self.metrics.sync_flushes_total.inc();
                debug!(capacity = self.capacity, "Flush buffer full, flushing oldest batch");
                if let Err(e) = self.flush_oldest(true).await {
                    warn!(error = %e, "Forced flush failed");
                }
            }
        }

        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dropped(1);
            }
            if let Some(r) = record.take() {
                queue.push_back(r);
            }
            queue.len()
        };
        self.observe_depth(len);
    }

    /// Inserts if there is room. Returns the new length on success.
    fn try_insert(&self, record: &mut Option<PersistedFlow>) -> Option<usize> {
        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return None;
            }
            queue.push_back(record.take()?);
            queue.len()
        };
        self.observe_depth(len);
        Some(len)
    }

    fn observe_depth(&self, len: usize) {
        self.stats.high_water.fetch_max(len, Ordering::Relaxed);
        self.metrics.set_buffer_depth(len);
        self.health
            .lock()
            .set_buffer_state(len, len >= self.capacity);
    }

    /// Writes the oldest batch to the store.
    ///
    /// With `only_if_full`, returns without writing unless the buffer is
    /// still at capacity once the flush lock is held.
    async fn flush_oldest(&self, only_if_full: bool) -> Result<usize, StoreError> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<PersistedFlow> = {
            let mut queue = self.queue.lock();
            if only_if_full && queue.len() < self.capacity {
                return Ok(0);
            }
            let n = self.batch_size.min(queue.len());
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let result = self.store.append_flow_batch(&batch).await;
        let latency = start.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                let n = batch.len();
                self.stats.flushed.fetch_add(n as u64, Ordering::Relaxed);
                self.metrics.record_flush(n, latency);
                self.health.lock().record_flush_success();
                let len = self.len();
                self.observe_depth(len);
                Ok(n)
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_flush_failure();
                self.health.lock().record_flush_failure();
                self.requeue(batch);
                Err(e)
            }
        }
    }

    /// Puts a failed batch back at the front, oldest first, as far as
    /// capacity allows. Records that do not fit are dropped.
    fn requeue(&self, batch: Vec<PersistedFlow>) {
        let (len, dropped) = {
            let mut queue = self.queue.lock();
            let room = self.capacity.saturating_sub(queue.len());
            let keep = batch.len().min(room);
            let dropped = batch.len() - keep;
            for record in batch.into_iter().take(keep).rev() {
                queue.push_front(record);
            }
            (queue.len(), dropped)
        };

        if dropped > 0 {
            self.stats
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            self.metrics.record_dropped(dropped);
            warn!(dropped, "Flush buffer overflow after failed append");
        }
        self.observe_depth(len);
    }

    /// Flushes full batches until fewer than `batch_size` records remain.
    pub async fn flush_full_batches(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        while self.len() >= self.batch_size {
            total += self.flush_oldest(false).await?;
        }
        Ok(total)
    }

    /// Flushes everything currently buffered. Stops at the first failure.
    pub async fn flush_all(&self) -> Result<usize, StoreError> {
        let mut total = 0;
        while !self.is_empty() {
            let n = self.flush_oldest(false).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Runs the background flusher until `cancel` fires, then drains.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(
            interval_ms = interval.as_millis() as u64,
            batch_size = self.batch_size,
            capacity = self.capacity,
            "Flusher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {
                    if let Err(e) = self.flush_full_batches().await {
                        warn!(error = %e, "Batch flush failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_all().await {
                        warn!(error = %e, "Interval flush failed");
                    }
                }
            }
        }

        self.drain().await;
    }

    /// Flushes every buffered record, retrying a failed append a few times
    /// before giving up.
    pub async fn drain(&self) {
        const DRAIN_ATTEMPTS: usize = 3;

        for attempt in 1..=DRAIN_ATTEMPTS {
            match self.flush_all().await {
                Ok(n) => {
                    if n > 0 {
                        info!(records = n, "Flush buffer drained");
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt < DRAIN_ATTEMPTS => {
                    warn!(error = %e, attempt, "Drain append failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    error!(error = %e, remaining = self.len(), "Drain abandoned");
                    return;
                }
            }
        }
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// True while the buffer is at capacity.
    pub fn is_saturated(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Buffer counters.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Health derived from saturation, failures and stalls.
    pub fn health_status(&self) -> HealthStatus {
        let mut health = self.health.lock();
        health.update_health();
        health.status()
    }
}

//! Write-behind decorator for the cache facade.
//!
//! `put_value` records the value in a pending map and a per-tier FIFO queue,
//! then makes sure exactly one flush task is draining the queues. Reads see
//! pending values before they are committed.
//!
//! # Flush task lifecycle
//!
//! The `flushing` flag moves from `false` to `true` only by compare-and-swap,
//! and only the winner spawns a task. The task drains both queues until they
//! are empty, clears the flag, and re-checks the queues: if a put slipped in
//! after the last drain but before the flag was cleared, the task wins the
//! flag back and keeps draining instead of leaving that work stranded.
//!
//! A failed batch is put back at the head of its queue and the task stops.
//! The next put re-arms a task that retries it. There is no backoff. A batch
//! rejected because its partition was released is discarded instead; the
//! partition is gone and retrying could never succeed.
//!
//! # Tiers
//!
//! Only the newest queued write for a key is committed; older items in
//! either queue are dropped when they reach the head. A value that was
//! already committed to the shared tier still shadows a later private write
//! for the same key, because the facade reads the shared tier first.

use super::ViewComputationCache;
use crate::config::WriteBehindConfig;
use crate::error::{Error, Result, StoreError};
use crate::metrics::CacheMetrics;
use crate::types::{CacheSelectHint, Tier, ValueKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A value accepted by `put_value` and not yet committed.
struct PendingWrite<K, V> {
    key: K,
    value: V,
    /// Orders writes to the same key; only the newest is kept pending.
    sequence: u64,
}

/// Buffers puts and commits them to the underlying cache in the background.
///
/// Callers must not run [`wait_for_pending_writes`](Self::wait_for_pending_writes)
/// concurrently with puts; it only waits for the task active when it is called.
pub struct WriteBehindCache<K: ValueKey, V> {
    inner: Arc<Inner<K, V>>,
}

struct Inner<K: ValueKey, V> {
    underlying: Arc<ViewComputationCache<K, V>>,
    config: WriteBehindConfig,
    metrics: Arc<CacheMetrics>,
    runtime: Handle,

    /// Newest uncommitted value per key, tagged with its sequence.
    pending: DashMap<K, (u64, V)>,
    private_queue: Mutex<VecDeque<PendingWrite<K, V>>>,
    shared_queue: Mutex<VecDeque<PendingWrite<K, V>>>,
    next_sequence: AtomicU64,

    flushing: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl<K, V> WriteBehindCache<K, V>
where
    K: ValueKey,
    V: Clone + Send + Sync + 'static,
{
    /// Wrap a cache, spawning flush tasks on the current tokio runtime.
    pub fn new(underlying: Arc<ViewComputationCache<K, V>>, config: WriteBehindConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("write-behind cache needs a tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(underlying, config, runtime, Arc::new(CacheMetrics::new())))
    }

    /// Wrap a cache, spawning flush tasks on the given runtime.
    pub fn with_runtime(
        underlying: Arc<ViewComputationCache<K, V>>,
        config: WriteBehindConfig,
        runtime: Handle,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                underlying,
                config,
                metrics,
                runtime,
                pending: DashMap::new(),
                private_queue: Mutex::new(VecDeque::new()),
                shared_queue: Mutex::new(VecDeque::new()),
                next_sequence: AtomicU64::new(0),
                flushing: AtomicBool::new(false),
                flush_task: Mutex::new(None),
            }),
        }
    }

    /// The wrapped cache.
    pub fn underlying(&self) -> &Arc<ViewComputationCache<K, V>> {
        &self.inner.underlying
    }

    /// Get a value, preferring an uncommitted write for the key.
    pub async fn get_value(&self, key: &K) -> Result<Option<V>> {
        if let Some(value) = self.inner.pending_value(key) {
            return Ok(Some(value));
        }
        self.inner.underlying.get_value(key).await
    }

    /// Queue a value for the given tier. Never waits for I/O.
    pub fn put_value(&self, key: K, value: V, tier: Tier) {
        self.inner.enqueue(key, value, tier);
        Inner::arm(&self.inner);
    }

    pub fn put_shared_value(&self, key: K, value: V) {
        self.put_value(key, value, Tier::Shared);
    }

    pub fn put_private_value(&self, key: K, value: V) {
        self.put_value(key, value, Tier::Private);
    }

    /// Queue many values, routing each to the tier the hint selects.
    pub fn put_values(&self, entries: Vec<(K, V)>, hint: &CacheSelectHint<K>) {
        if entries.is_empty() {
            return;
        }
        for (key, value) in entries {
            let tier = hint.tier_for(&key);
            self.inner.enqueue(key, value, tier);
        }
        Inner::arm(&self.inner);
    }

    /// Wait for the active flush task, if any, and report how it ended.
    ///
    /// Returns the error that stopped the task when a batch failed; the
    /// failed items stay queued and pending.
    pub async fn wait_for_pending_writes(&self) -> Result<()> {
        let task = self.inner.flush_task.lock().take();
        match task {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("flush task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    /// Number of keys with an uncommitted value.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Whether a flush task currently holds the flag.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }
}

impl<K, V> Inner<K, V>
where
    K: ValueKey,
    V: Clone + Send + Sync + 'static,
{
    fn pending_value(&self, key: &K) -> Option<V> {
        self.pending.get(key).map(|entry| entry.value().1.clone())
    }

    fn queue(&self, tier: Tier) -> &Mutex<VecDeque<PendingWrite<K, V>>> {
        match tier {
            Tier::Private => &self.private_queue,
            Tier::Shared => &self.shared_queue,
        }
    }

    fn enqueue(&self, key: K, value: V, tier: Tier) {
        // Holding the queue lock keeps queue order equal to sequence order and
        // keeps a flusher from retiring the item before it is pending.
        let mut queue = self.queue(tier).lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.pending
            .entry(key.clone())
            .and_modify(|slot| {
                if slot.0 < sequence {
                    *slot = (sequence, value.clone());
                }
            })
            .or_insert_with(|| (sequence, value.clone()));
        queue.push_back(PendingWrite {
            key,
            value,
            sequence,
        });
        drop(queue);
        self.metrics.write_behind_queued.inc();
        self.metrics.write_behind_pending.inc();
    }

    fn queues_empty(&self) -> bool {
        self.private_queue.lock().is_empty() && self.shared_queue.lock().is_empty()
    }

    /// Start a flush task unless one already holds the flag.
    fn arm(this: &Arc<Self>) {
        let mut task = this.flush_task.lock();
        if this
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = this.clone();
            *task = Some(this.runtime.spawn(async move { inner.run_flush().await }));
        }
    }

    async fn run_flush(self: Arc<Self>) -> Result<()> {
        loop {
            let drained = self.drain().await;
            self.flushing.store(false, Ordering::Release);
            drained?;

            if self.queues_empty() {
                return Ok(());
            }
            // Work arrived after the last drain; re-arm unless a put already did.
            if self
                .flushing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            debug!("Flush task re-armed");
        }
    }

    async fn drain(&self) -> Result<()> {
        loop {
            let mut progressed = false;
            for tier in [Tier::Private, Tier::Shared] {
                let batch = self.take_batch(tier);
                if batch.is_empty() {
                    continue;
                }
                progressed = true;

                if let Err(e) = self.commit(tier, &batch).await {
                    let count = batch.len();
                    if matches!(e, Error::Store(StoreError::Deleted(_))) {
                        warn!(
                            tier = tier.as_str(),
                            count,
                            "Partition released before write-behind commit, discarding batch"
                        );
                        self.discard(batch);
                        continue;
                    }
                    self.requeue(tier, batch);
                    self.metrics.write_behind_flush_failures.inc();
                    warn!(
                        tier = tier.as_str(),
                        count,
                        error = %e,
                        "Write-behind flush failed, items stay queued until the next put"
                    );
                    return Err(e);
                }
                self.retire(batch);
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Take the next batch of live items from a queue, dropping items that a
    /// newer write for the same key has superseded.
    fn take_batch(&self, tier: Tier) -> Vec<PendingWrite<K, V>> {
        let limit = self.config.max_batch_size.max(1);
        let mut queue = self.queue(tier).lock();
        loop {
            let count = queue.len().min(limit);
            if count == 0 {
                return Vec::new();
            }
            let (live, superseded): (Vec<_>, Vec<_>) = queue
                .drain(..count)
                .partition(|item| !self.is_superseded(item));
            if !superseded.is_empty() {
                debug!(tier = tier.as_str(), count = superseded.len(), "Dropped superseded writes");
                self.retire(superseded);
            }
            if !live.is_empty() {
                return live;
            }
        }
    }

    /// An item is live only while it is the pending write for its key; once
    /// a newer write was queued or committed it is stale.
    fn is_superseded(&self, item: &PendingWrite<K, V>) -> bool {
        self.pending
            .get(&item.key)
            .map_or(true, |slot| slot.0 != item.sequence)
    }

    async fn commit(&self, tier: Tier, batch: &[PendingWrite<K, V>]) -> Result<()> {
        match batch {
            [single] => {
                self.underlying
                    .put_value(&single.key, &single.value, tier)
                    .await
            }
            _ => {
                let entries: Vec<(K, V)> = batch
                    .iter()
                    .map(|item| (item.key.clone(), item.value.clone()))
                    .collect();
                self.underlying.put_tier_values(tier, &entries).await
            }
        }
    }

    fn requeue(&self, tier: Tier, batch: Vec<PendingWrite<K, V>>) {
        let mut queue = self.queue(tier).lock();
        for item in batch.into_iter().rev() {
            queue.push_front(item);
        }
    }

    fn retire(&self, batch: Vec<PendingWrite<K, V>>) {
        let count = batch.len();
        for item in batch {
            // A newer put for the same key stays pending.
            self.pending
                .remove_if(&item.key, |_, (sequence, _)| *sequence == item.sequence);
        }
        self.metrics.write_behind_flushed.inc_by(count as u64);
        self.metrics.write_behind_pending.sub(count as i64);
    }

    fn discard(&self, batch: Vec<PendingWrite<K, V>>) {
        let count = batch.len();
        for item in batch {
            self.pending
                .remove_if(&item.key, |_, (sequence, _)| *sequence == item.sequence);
        }
        self.metrics.write_behind_discarded.inc_by(count as u64);
        self.metrics.write_behind_pending.sub(count as i64);
    }
}

impl<K: ValueKey, V> std::fmt::Debug for WriteBehindCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindCache")
            .field("partition", self.inner.underlying.partition())
            .field("pending", &self.inner.pending.len())
            .field("flushing", &self.inner.flushing.load(Ordering::Relaxed))
            .finish()
    }
}

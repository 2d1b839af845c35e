//! Metrics for monitoring the cache.
//!
//! Every component takes an `Arc<CacheMetrics>`; one instance is usually
//! shared by the whole process so the snapshot covers facade, write-behind
//! and remote traffic together.
//!
//! ```rust,ignore
//! let metrics = Arc::new(CacheMetrics::new());
//! let source = CacheSource::new(allocator, factory, codec).with_metrics(metrics.clone());
//!
//! let snapshot = metrics.snapshot();
//! println!("Hit rate: {:.2}%", snapshot.hit_rate() * 100.0);
//! ```

mod counters;

pub use counters::{Counter, Gauge, LabeledCounter};

/// Aggregated metrics for the cache subsystem.
#[derive(Debug)]
pub struct CacheMetrics {
    /// Values requested from a cache facade.
    pub value_gets: Counter,
    /// Value requests answered with a payload.
    pub value_hits: Counter,
    /// Value requests answered with absence.
    pub value_misses: Counter,
    /// Values written through a cache facade.
    pub value_puts: Counter,

    /// Fresh ids handed out by allocators.
    pub ids_allocated: Counter,

    /// Values accepted by write-behind caches.
    pub write_behind_queued: Counter,
    /// Values committed by write-behind flush tasks.
    pub write_behind_flushed: Counter,
    /// Flush tasks that stopped on a failure.
    pub write_behind_flush_failures: Counter,
    /// Values dropped because their partition was released before commit.
    pub write_behind_discarded: Counter,
    /// Values accepted but not yet committed.
    pub write_behind_pending: Gauge,

    /// Remote requests sent, by message kind.
    pub remote_requests: LabeledCounter,
    /// Remote responses matched to a waiting caller.
    pub remote_responses: Counter,
    /// Remote responses whose correlation id had no waiter.
    pub remote_unmatched_responses: Counter,
}

impl CacheMetrics {
    /// Create a fresh metrics set.
    pub fn new() -> Self {
        Self {
            value_gets: Counter::new("viewcache_value_gets_total"),
            value_hits: Counter::new("viewcache_value_hits_total"),
            value_misses: Counter::new("viewcache_value_misses_total"),
            value_puts: Counter::new("viewcache_value_puts_total"),
            ids_allocated: Counter::new("viewcache_ids_allocated_total"),
            write_behind_queued: Counter::new("viewcache_write_behind_queued_total"),
            write_behind_flushed: Counter::new("viewcache_write_behind_flushed_total"),
            write_behind_flush_failures: Counter::new("viewcache_write_behind_flush_failures_total"),
            write_behind_discarded: Counter::new("viewcache_write_behind_discarded_total"),
            write_behind_pending: Gauge::new("viewcache_write_behind_pending"),
            remote_requests: LabeledCounter::new("viewcache_remote_requests_total"),
            remote_responses: Counter::new("viewcache_remote_responses_total"),
            remote_unmatched_responses: Counter::new("viewcache_remote_unmatched_responses_total"),
        }
    }

    /// Record the outcome of a value lookup.
    pub fn record_get(&self, hit: bool) {
        self.value_gets.inc();
        if hit {
            self.value_hits.inc();
        } else {
            self.value_misses.inc();
        }
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            value_gets: self.value_gets.get(),
            value_hits: self.value_hits.get(),
            value_misses: self.value_misses.get(),
            value_puts: self.value_puts.get(),
            ids_allocated: self.ids_allocated.get(),
            write_behind_queued: self.write_behind_queued.get(),
            write_behind_flushed: self.write_behind_flushed.get(),
            write_behind_flush_failures: self.write_behind_flush_failures.get(),
            write_behind_discarded: self.write_behind_discarded.get(),
            write_behind_pending: self.write_behind_pending.get(),
            remote_requests: self.remote_requests.total(),
            remote_responses: self.remote_responses.get(),
            remote_unmatched_responses: self.remote_unmatched_responses.get(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of [`CacheMetrics`] values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub value_gets: u64,
    pub value_hits: u64,
    pub value_misses: u64,
    pub value_puts: u64,
    pub ids_allocated: u64,
    pub write_behind_queued: u64,
    pub write_behind_flushed: u64,
    pub write_behind_flush_failures: u64,
    pub write_behind_discarded: u64,
    pub write_behind_pending: i64,
    pub remote_requests: u64,
    pub remote_responses: u64,
    pub remote_unmatched_responses: u64,
}

impl MetricsSnapshot {
    /// Fraction of value lookups that found a payload.
    pub fn hit_rate(&self) -> f64 {
        if self.value_gets == 0 {
            0.0
        } else {
            self.value_hits as f64 / self.value_gets as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_get_and_snapshot() {
        let metrics = CacheMetrics::new();
        metrics.record_get(true);
        metrics.record_get(true);
        metrics.record_get(false);
        metrics.remote_requests.inc("lookup");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.value_gets, 3);
        assert_eq!(snapshot.value_hits, 2);
        assert_eq!(snapshot.value_misses, 1);
        assert_eq!(snapshot.remote_requests, 1);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(MetricsSnapshot::default().hit_rate(), 0.0);
    }
}

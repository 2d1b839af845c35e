//! In-memory identifier allocator.

use super::IdentifierAllocator;
use crate::error::{AllocationError, Result};
use crate::metrics::CacheMetrics;
use crate::types::{NumericId, ValueKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// First id handed out by a fresh allocator.
const FIRST_ID: NumericId = 1;

/// Allocator backed by a concurrent map and an atomic counter.
///
/// Same contract as the persistent allocator, without durability. Losing
/// racers may burn a counter value, so ids can have gaps, but they are
/// never reused.
#[derive(Debug)]
pub struct InMemoryIdentifierAllocator<K: ValueKey> {
    /// Forward mapping.
    ids: DashMap<K, NumericId>,

    /// Reverse mapping.
    keys: DashMap<NumericId, K>,

    /// Next id to hand out.
    next_id: AtomicU64,

    metrics: Arc<CacheMetrics>,
}

impl<K: ValueKey> InMemoryIdentifierAllocator<K> {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(CacheMetrics::new()))
    }

    /// Create an empty allocator reporting to the given metrics.
    pub fn with_metrics(metrics: Arc<CacheMetrics>) -> Self {
        Self {
            ids: DashMap::new(),
            keys: DashMap::new(),
            next_id: AtomicU64::new(FIRST_ID),
            metrics,
        }
    }

    /// Create an allocator pre-seeded with existing mappings.
    ///
    /// Fresh allocations continue above the highest seeded id.
    pub fn from_mappings(mappings: impl IntoIterator<Item = (K, NumericId)>) -> Self {
        let allocator = Self::new();
        let mut highest = FIRST_ID - 1;
        for (key, id) in mappings {
            highest = highest.max(id);
            allocator.keys.insert(id, key.clone());
            allocator.ids.insert(key, id);
        }
        allocator.next_id.store(highest + 1, Ordering::SeqCst);
        allocator
    }

    /// Number of keys with an allocated id.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no id has been allocated.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn allocate(&self, key: &K) -> Result<NumericId> {
        if let Some(id) = self.ids.get(key) {
            return Ok(*id);
        }

        // The entry holds the shard lock, so exactly one racer inserts.
        let mut fresh = None;
        let id = *self.ids.entry(key.clone()).or_try_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id == NumericId::MAX {
                return Err(AllocationError::Exhausted);
            }
            fresh = Some(id);
            Ok(id)
        })?;

        if let Some(id) = fresh {
            self.keys.insert(id, key.clone());
            self.metrics.ids_allocated.inc();
        }
        Ok(id)
    }
}

impl<K: ValueKey> Default for InMemoryIdentifierAllocator<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierAllocator<K> for InMemoryIdentifierAllocator<K> {
    async fn get_id(&self, key: &K) -> Result<NumericId> {
        self.allocate(key)
    }

    async fn get_ids(&self, keys: &[K]) -> Result<std::collections::HashMap<K, NumericId>> {
        keys.iter()
            .map(|key| self.allocate(key).map(|id| (key.clone(), id)))
            .collect()
    }

    async fn get_key(&self, id: NumericId) -> Result<Option<K>> {
        Ok(self.keys.get(&id).map(|key| key.clone()))
    }
}

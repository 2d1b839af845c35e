//! Moka-backed local caching decorator for binary stores.

use super::{BinaryStore, BinaryStoreFactory};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::types::{CachePartitionKey, CacheStats, NumericId};
use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Wraps another store with a bounded local cache for reads.
///
/// Writes reach the underlying store before the local cache, so evicting
/// a local entry can never lose data that was not yet persisted. A read
/// that overlapped a write or delete returns what it read but does not
/// populate the local cache.
pub struct CachingBinaryStore {
    underlying: Arc<dyn BinaryStore>,

    /// Local copies of recently read or written payloads.
    local: Cache<NumericId, Bytes>,

    /// Bumped by every write and delete once the underlying store accepted it.
    write_epoch: AtomicU64,

    /// Hit counter for statistics.
    hits: AtomicU64,

    /// Miss counter for statistics.
    misses: AtomicU64,
}

impl CachingBinaryStore {
    /// Wrap a store, keeping at most `capacity` payloads locally.
    pub fn new(underlying: Arc<dyn BinaryStore>, capacity: u64) -> Self {
        Self {
            underlying,
            local: Cache::builder().max_capacity(capacity).build(),
            write_epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get local cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.local.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Run pending maintenance tasks (evictions, counts).
    pub async fn run_pending_tasks(&self) {
        self.local.run_pending_tasks().await;
    }

    /// Cache a payload read from the underlying store unless a write landed
    /// since `epoch` was taken. Never replaces a payload a write installed.
    async fn fill(&self, epoch: u64, id: NumericId, payload: Bytes) {
        if self.write_epoch.load(Ordering::Acquire) == epoch {
            self.local.entry(id).or_insert(payload).await;
        }
    }
}

impl std::fmt::Debug for CachingBinaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingBinaryStore")
            .field("underlying", &self.underlying)
            .field("entry_count", &self.local.entry_count())
            .finish()
    }
}

#[async_trait]
impl BinaryStore for CachingBinaryStore {
    async fn get(&self, id: NumericId) -> Result<Option<Bytes>> {
        if let Some(payload) = self.local.get(&id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(payload));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let epoch = self.write_epoch.load(Ordering::Acquire);
        let payload = self.underlying.get(id).await?;
        if let Some(payload) = &payload {
            self.fill(epoch, id, payload.clone()).await;
        }
        Ok(payload)
    }

    async fn get_many(&self, ids: &[NumericId]) -> Result<HashMap<NumericId, Bytes>> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for &id in ids {
            match self.local.get(&id).await {
                Some(payload) => {
                    found.insert(id, payload);
                }
                None => misses.push(id),
            }
        }
        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(misses.len() as u64, Ordering::Relaxed);

        if !misses.is_empty() {
            let epoch = self.write_epoch.load(Ordering::Acquire);
            for (id, payload) in self.underlying.get_many(&misses).await? {
                self.fill(epoch, id, payload.clone()).await;
                found.insert(id, payload);
            }
        }
        Ok(found)
    }

    async fn put(&self, id: NumericId, payload: Bytes) -> Result<()> {
        self.underlying.put(id, payload.clone()).await?;
        self.write_epoch.fetch_add(1, Ordering::AcqRel);
        self.local.insert(id, payload).await;
        Ok(())
    }

    async fn put_many(&self, entries: Vec<(NumericId, Bytes)>) -> Result<()> {
        self.underlying.put_many(entries.clone()).await?;
        self.write_epoch.fetch_add(1, Ordering::AcqRel);
        for (id, payload) in entries {
            self.local.insert(id, payload).await;
        }
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.underlying.delete().await?;
        self.write_epoch.fetch_add(1, Ordering::AcqRel);
        self.local.invalidate_all();
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(NumericId, Bytes)>> {
        self.underlying.entries().await
    }
}

/// Wraps every store produced by another factory in a [`CachingBinaryStore`].
#[derive(Debug)]
pub struct CachingBinaryStoreFactory {
    underlying: Arc<dyn BinaryStoreFactory>,
    capacity: u64,
}

impl CachingBinaryStoreFactory {
    /// Create the factory; each produced store caches up to `capacity` payloads.
    pub fn new(underlying: Arc<dyn BinaryStoreFactory>, capacity: u64) -> Self {
        Self {
            underlying,
            capacity,
        }
    }

    /// Create the factory, sizing each store by `config.local_capacity`.
    pub fn from_config(underlying: Arc<dyn BinaryStoreFactory>, config: &CacheConfig) -> Self {
        Self::new(underlying, config.local_capacity)
    }
}

impl BinaryStoreFactory for CachingBinaryStoreFactory {
    fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
        let store = self.underlying.create_store(partition)?;
        Ok(Arc::new(CachingBinaryStore::new(store, self.capacity)))
    }
}

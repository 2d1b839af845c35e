//! Typed cache facade over an allocator, two store tiers and a codec.
//!
//! A [`ViewComputationCache`] serves one partition. Values are addressed by
//! their [`ValueKey`]; the facade resolves the key to a [`NumericId`] through
//! the allocator, then reads or writes the encoded payload in the private or
//! shared store. The caller decides which tier a value belongs in.

pub mod source;
pub mod write_behind;

pub use source::CacheSource;
pub use write_behind::WriteBehindCache;

use crate::allocator::IdentifierAllocator;
use crate::codec::ValueCodec;
use crate::error::Result;
use crate::metrics::CacheMetrics;
use crate::store::BinaryStore;
use crate::types::{CachePartitionKey, CacheSelectHint, NumericId, Tier, ValueKey};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Cache facade for one partition.
pub struct ViewComputationCache<K: ValueKey, V> {
    partition: CachePartitionKey,
    allocator: Arc<dyn IdentifierAllocator<K>>,
    private_store: Arc<dyn BinaryStore>,
    shared_store: Arc<dyn BinaryStore>,
    codec: Arc<dyn ValueCodec<V>>,
    metrics: Arc<CacheMetrics>,
}

impl<K: ValueKey, V> ViewComputationCache<K, V> {
    /// Create a facade. Both tiers may be backed by the same store.
    pub fn new(
        partition: CachePartitionKey,
        allocator: Arc<dyn IdentifierAllocator<K>>,
        private_store: Arc<dyn BinaryStore>,
        shared_store: Arc<dyn BinaryStore>,
        codec: Arc<dyn ValueCodec<V>>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            partition,
            allocator,
            private_store,
            shared_store,
            codec,
            metrics,
        }
    }

    pub fn partition(&self) -> &CachePartitionKey {
        &self.partition
    }

    pub fn allocator(&self) -> &Arc<dyn IdentifierAllocator<K>> {
        &self.allocator
    }

    pub fn private_store(&self) -> &Arc<dyn BinaryStore> {
        &self.private_store
    }

    pub fn shared_store(&self) -> &Arc<dyn BinaryStore> {
        &self.shared_store
    }

    pub fn codec(&self) -> &Arc<dyn ValueCodec<V>> {
        &self.codec
    }

    /// The store backing a tier.
    pub fn store(&self, tier: Tier) -> &Arc<dyn BinaryStore> {
        match tier {
            Tier::Private => &self.private_store,
            Tier::Shared => &self.shared_store,
        }
    }
}

impl<K: ValueKey, V: Send + Sync + 'static> ViewComputationCache<K, V> {
    fn single_store(&self) -> bool {
        Arc::ptr_eq(&self.private_store, &self.shared_store)
    }

    /// Get a value, looking in the shared tier first and then the private tier.
    pub async fn get_value(&self, key: &K) -> Result<Option<V>> {
        let id = self.allocator.get_id(key).await?;
        let mut payload = self.shared_store.get(id).await?;
        if payload.is_none() && !self.single_store() {
            payload = self.private_store.get(id).await?;
        }
        self.decode_found(key, id, payload)
    }

    /// Get a value from the given tier only.
    pub async fn get_value_with_hint(&self, key: &K, tier: Tier) -> Result<Option<V>> {
        let id = self.allocator.get_id(key).await?;
        let payload = self.store(tier).get(id).await?;
        self.decode_found(key, id, payload)
    }

    /// Get many values with one allocator call and at most one call per tier.
    ///
    /// Results follow the input order.
    pub async fn get_values(&self, keys: &[K]) -> Result<Vec<(K, Option<V>)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.allocator.get_ids(keys).await?;
        let mut wanted: Vec<NumericId> = ids.values().copied().collect();
        wanted.sort_unstable();
        wanted.dedup();

        let mut found = self.shared_store.get_many(&wanted).await?;
        if !self.single_store() {
            let missing: Vec<NumericId> = wanted
                .into_iter()
                .filter(|id| !found.contains_key(id))
                .collect();
            if !missing.is_empty() {
                found.extend(self.private_store.get_many(&missing).await?);
            }
        }

        keys.iter()
            .map(|key| {
                let value = match ids.get(key) {
                    Some(id) => self.decode_found(key, *id, found.get(id).cloned())?,
                    None => None,
                };
                Ok((key.clone(), value))
            })
            .collect()
    }

    /// Put a value into the given tier.
    pub async fn put_value(&self, key: &K, value: &V, tier: Tier) -> Result<()> {
        let payload = self.codec.encode(value)?;
        let id = self.allocator.get_id(key).await?;
        trace!(partition = %self.partition, id, tier = tier.as_str(), "Put value");
        self.store(tier).put(id, payload).await?;
        self.metrics.value_puts.inc();
        Ok(())
    }

    pub async fn put_shared_value(&self, key: &K, value: &V) -> Result<()> {
        self.put_value(key, value, Tier::Shared).await
    }

    pub async fn put_private_value(&self, key: &K, value: &V) -> Result<()> {
        self.put_value(key, value, Tier::Private).await
    }

    /// Put many values, routing each to the tier the hint selects.
    pub async fn put_values(&self, entries: &[(K, V)], hint: &CacheSelectHint<K>) -> Result<()> {
        let (private, shared): (Vec<_>, Vec<_>) = entries
            .iter()
            .partition(|(key, _)| hint.tier_for(key) == Tier::Private);
        self.put_tier_entries(Tier::Private, &private).await?;
        self.put_tier_entries(Tier::Shared, &shared).await
    }

    /// Put many values into one tier with one allocator call and one store call.
    ///
    /// Entries are written in order, so a repeated key keeps its last value.
    pub async fn put_tier_values(&self, tier: Tier, entries: &[(K, V)]) -> Result<()> {
        let refs: Vec<&(K, V)> = entries.iter().collect();
        self.put_tier_entries(tier, &refs).await
    }

    async fn put_tier_entries(&self, tier: Tier, entries: &[&(K, V)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<K> = entries.iter().map(|(key, _)| key.clone()).collect();
        let ids = self.allocator.get_ids(&keys).await?;

        let mut batch: Vec<(NumericId, Bytes)> = Vec::with_capacity(entries.len());
        for (key, value) in entries.iter().map(|entry| (&entry.0, &entry.1)) {
            let id = ids.get(key).copied().ok_or_else(|| {
                crate::error::Error::Internal(format!("allocator returned no id for {:?}", key))
            })?;
            batch.push((id, self.codec.encode(value)?));
        }

        trace!(partition = %self.partition, count = batch.len(), tier = tier.as_str(), "Put values");
        self.store(tier).put_many(batch).await?;
        self.metrics.value_puts.inc_by(entries.len() as u64);
        Ok(())
    }

    fn decode_found(&self, key: &K, id: NumericId, payload: Option<Bytes>) -> Result<Option<V>> {
        self.metrics.record_get(payload.is_some());
        match payload {
            Some(payload) => {
                trace!(partition = %self.partition, id, ?key, "Cache hit");
                self.codec.decode(&payload).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Gather every (id, payload) held by a tier, for copying.
    async fn tier_entries(&self, tier: Tier) -> Result<HashMap<NumericId, Bytes>> {
        Ok(self.store(tier).entries().await?.into_iter().collect())
    }
}

impl<K: ValueKey, V> Clone for ViewComputationCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            partition: self.partition.clone(),
            allocator: self.allocator.clone(),
            private_store: self.private_store.clone(),
            shared_store: self.shared_store.clone(),
            codec: self.codec.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<K: ValueKey, V> std::fmt::Debug for ViewComputationCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewComputationCache")
            .field("partition", &self.partition)
            .field("private_store", &self.private_store)
            .field("shared_store", &self.shared_store)
            .finish()
    }
}

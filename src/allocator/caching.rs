//! Bounded local front for a slower allocator.

use super::IdentifierAllocator;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::types::{NumericId, ValueKey};
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Caches key -> id answers from an underlying allocator.
///
/// Mappings never change once allocated, so an evicted entry only costs
/// another round trip to the underlying allocator.
pub struct CachingIdentifierAllocator<K: ValueKey> {
    underlying: Arc<dyn IdentifierAllocator<K>>,
    ids: Cache<K, NumericId>,
}

impl<K: ValueKey> CachingIdentifierAllocator<K> {
    /// Wrap an allocator, keeping at most `capacity` mappings locally.
    pub fn new(underlying: Arc<dyn IdentifierAllocator<K>>, capacity: u64) -> Self {
        Self {
            underlying,
            ids: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Wrap an allocator, sized by `config.local_capacity`.
    pub fn from_config(underlying: Arc<dyn IdentifierAllocator<K>>, config: &CacheConfig) -> Self {
        Self::new(underlying, config.local_capacity)
    }

    /// Number of locally cached mappings (approximate).
    pub fn cached_count(&self) -> u64 {
        self.ids.entry_count()
    }
}

impl<K: ValueKey> std::fmt::Debug for CachingIdentifierAllocator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingIdentifierAllocator")
            .field("cached_count", &self.cached_count())
            .finish()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierAllocator<K> for CachingIdentifierAllocator<K> {
    async fn get_id(&self, key: &K) -> Result<NumericId> {
        if let Some(id) = self.ids.get(key).await {
            return Ok(id);
        }
        let id = self.underlying.get_id(key).await?;
        self.ids.insert(key.clone(), id).await;
        Ok(id)
    }

    async fn get_ids(&self, keys: &[K]) -> Result<HashMap<K, NumericId>> {
        let mut ids = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        for key in keys {
            match self.ids.get(key).await {
                Some(id) => {
                    ids.insert(key.clone(), id);
                }
                None => misses.push(key.clone()),
            }
        }

        if !misses.is_empty() {
            trace!(hits = ids.len(), misses = misses.len(), "Resolving id misses");
            let fetched = self.underlying.get_ids(&misses).await?;
            for (key, id) in fetched {
                self.ids.insert(key.clone(), id).await;
                ids.insert(key, id);
            }
        }
        Ok(ids)
    }

    async fn get_key(&self, id: NumericId) -> Result<Option<K>> {
        self.underlying.get_key(id).await
    }
}

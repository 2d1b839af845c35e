//! Registry of cache partitions.

use super::{ViewComputationCache, WriteBehindCache};
use crate::allocator::{IdentifierAllocator, InMemoryIdentifierAllocator};
use crate::codec::ValueCodec;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::store::{store_identity, BinaryStore, BinaryStoreFactory, InMemoryBinaryStore};
use crate::types::{CachePartitionKey, Tier, ValueKey};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Creates partition caches on first use and releases them by generation.
///
/// Every partition shares one allocator and one codec. Stores come from a
/// factory per tier; with a single factory both tiers of a partition share
/// one store.
pub struct CacheSource<K: ValueKey, V> {
    allocator: Arc<dyn IdentifierAllocator<K>>,
    private_factory: Arc<dyn BinaryStoreFactory>,
    shared_factory: Option<Arc<dyn BinaryStoreFactory>>,
    codec: Arc<dyn ValueCodec<V>>,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,

    caches: DashMap<CachePartitionKey, Arc<ViewComputationCache<K, V>>>,

    /// Guards partition creation only; lookups of existing partitions skip it.
    create_lock: Mutex<()>,
}

impl<K, V> CacheSource<K, V>
where
    K: ValueKey,
    V: Send + Sync + 'static,
{
    /// Registry whose partitions keep both tiers in one store per partition.
    pub fn new(
        allocator: Arc<dyn IdentifierAllocator<K>>,
        factory: Arc<dyn BinaryStoreFactory>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        Self::build(allocator, factory, None, codec)
    }

    /// Registry with a separate store factory per tier.
    pub fn with_tier_factories(
        allocator: Arc<dyn IdentifierAllocator<K>>,
        private_factory: Arc<dyn BinaryStoreFactory>,
        shared_factory: Arc<dyn BinaryStoreFactory>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        Self::build(allocator, private_factory, Some(shared_factory), codec)
    }

    fn build(
        allocator: Arc<dyn IdentifierAllocator<K>>,
        private_factory: Arc<dyn BinaryStoreFactory>,
        shared_factory: Option<Arc<dyn BinaryStoreFactory>>,
        codec: Arc<dyn ValueCodec<V>>,
    ) -> Self {
        Self {
            allocator,
            private_factory,
            shared_factory,
            codec,
            metrics: Arc::new(CacheMetrics::new()),
            config: CacheConfig::default(),
            caches: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Report facade activity to the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Use the given configuration for write-behind caches built by this registry.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the cache for a partition, creating it on first access.
    pub fn get_cache(
        &self,
        namespace: &str,
        configuration: &str,
        generation: i64,
    ) -> Result<Arc<ViewComputationCache<K, V>>> {
        let partition = CachePartitionKey::new(namespace, configuration, generation);
        if let Some(cache) = self.caches.get(&partition) {
            return Ok(cache.clone());
        }

        let _guard = self.create_lock.lock();
        if let Some(cache) = self.caches.get(&partition) {
            return Ok(cache.clone());
        }

        let private_store = self.private_factory.create_store(&partition)?;
        let shared_store = match &self.shared_factory {
            Some(factory) => factory.create_store(&partition)?,
            None => private_store.clone(),
        };
        let cache = Arc::new(ViewComputationCache::new(
            partition.clone(),
            self.allocator.clone(),
            private_store,
            shared_store,
            self.codec.clone(),
            self.metrics.clone(),
        ));
        self.caches.insert(partition.clone(), cache.clone());

        debug!(partition = %partition, "Created cache partition");
        Ok(cache)
    }

    /// Delete every store of every configuration in a generation.
    ///
    /// Each distinct store is deleted exactly once. All deletions are
    /// attempted; the first failure is returned. Partitions stay registered
    /// until their stores are gone, so a concurrent `get_cache` hands out
    /// the dying partition rather than reopening its stores under the
    /// same names mid-delete.
    pub async fn release_caches(&self, namespace: &str, generation: i64) -> Result<()> {
        let doomed: Vec<(CachePartitionKey, Arc<ViewComputationCache<K, V>>)> = self
            .caches
            .iter()
            .filter(|entry| entry.key().belongs_to(namespace, generation))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut seen = HashSet::new();
        let mut stores: Vec<Arc<dyn BinaryStore>> = Vec::new();
        for (_, cache) in &doomed {
            for tier in [Tier::Private, Tier::Shared] {
                let store = cache.store(tier);
                if seen.insert(store_identity(store)) {
                    stores.push(store.clone());
                }
            }
        }

        let mut first_error = None;
        for store in &stores {
            if let Err(e) = store.delete().await {
                warn!(namespace, generation, error = %e, "Failed to delete store");
                first_error.get_or_insert(e);
            }
        }

        for (partition, cache) in &doomed {
            self.caches
                .remove_if(partition, |_, current| Arc::ptr_eq(current, cache));
        }

        info!(
            namespace,
            generation,
            partitions = doomed.len(),
            stores = stores.len(),
            "Released cache partitions"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Copy a partition's current contents into a detached in-memory cache.
    ///
    /// The copy has its own allocator and stores; later writes on either
    /// side are invisible to the other. Needs reverse lookup and store
    /// enumeration from the backends.
    pub async fn clone_cache(
        &self,
        namespace: &str,
        configuration: &str,
        generation: i64,
    ) -> Result<ViewComputationCache<K, V>> {
        let live = self.get_cache(namespace, configuration, generation)?;
        let name = live.partition().to_string();

        let private_entries = live.tier_entries(Tier::Private).await?;
        let single_store = Arc::ptr_eq(live.private_store(), live.shared_store());
        let shared_entries = if single_store {
            private_entries.clone()
        } else {
            live.tier_entries(Tier::Shared).await?
        };

        let mut mappings = Vec::new();
        let ids: HashSet<_> = private_entries.keys().chain(shared_entries.keys()).copied().collect();
        for id in ids {
            match live.allocator().get_key(id).await? {
                Some(key) => mappings.push((key, id)),
                None => warn!(id, partition = %name, "Stored id has no key, skipping"),
            }
        }

        let private_store: Arc<dyn BinaryStore> =
            Arc::new(InMemoryBinaryStore::from_entries(format!("{}/private", name), private_entries));
        let shared_store: Arc<dyn BinaryStore> = if single_store {
            private_store.clone()
        } else {
            Arc::new(InMemoryBinaryStore::from_entries(format!("{}/shared", name), shared_entries))
        };

        debug!(partition = %name, keys = mappings.len(), "Cloned cache partition");
        Ok(ViewComputationCache::new(
            live.partition().clone(),
            Arc::new(InMemoryIdentifierAllocator::from_mappings(mappings)),
            private_store,
            shared_store,
            live.codec().clone(),
            Arc::new(CacheMetrics::new()),
        ))
    }

    /// Number of live partitions.
    pub fn partition_count(&self) -> usize {
        self.caches.len()
    }

    /// Whether a partition is live.
    pub fn contains(&self, namespace: &str, configuration: &str, generation: i64) -> bool {
        self.caches
            .contains_key(&CachePartitionKey::new(namespace, configuration, generation))
    }
}

impl<K, V> CacheSource<K, V>
where
    K: ValueKey,
    V: Clone + Send + Sync + 'static,
{
    /// Get a write-behind cache over a partition, using the registry's
    /// write-behind configuration and metrics. Must run inside a tokio runtime.
    pub fn get_write_behind_cache(
        &self,
        namespace: &str,
        configuration: &str,
        generation: i64,
    ) -> Result<WriteBehindCache<K, V>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("write-behind cache needs a tokio runtime: {}", e)))?;
        let cache = self.get_cache(namespace, configuration, generation)?;
        Ok(WriteBehindCache::with_runtime(
            cache,
            self.config.write_behind.clone(),
            runtime,
            self.metrics.clone(),
        ))
    }
}

impl<K: ValueKey, V> std::fmt::Debug for CacheSource<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSource")
            .field("partitions", &self.caches.len())
            .field("tier_factories", &self.shared_factory.is_some())
            .finish()
    }
}

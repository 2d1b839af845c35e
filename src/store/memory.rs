//! In-memory binary store.

use super::{BinaryStore, BinaryStoreFactory};
use crate::error::{Result, StoreError};
use crate::types::{CachePartitionKey, NumericId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Binary store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryBinaryStore {
    name: String,
    entries: DashMap<NumericId, Bytes>,
    deleted: AtomicBool,
}

impl InMemoryBinaryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            deleted: AtomicBool::new(false),
        }
    }

    /// Create a store holding a copy of the given entries.
    pub fn from_entries(name: impl Into<String>, entries: impl IntoIterator<Item = (NumericId, Bytes)>) -> Self {
        let store = Self::new(name);
        for (id, payload) in entries {
            store.entries.insert(id, payload);
        }
        store
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl BinaryStore for InMemoryBinaryStore {
    async fn get(&self, id: NumericId) -> Result<Option<Bytes>> {
        Ok(self.entries.get(&id).map(|payload| payload.clone()))
    }

    async fn put(&self, id: NumericId, payload: Bytes) -> Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(StoreError::Deleted(self.name.clone()).into());
        }
        self.entries.insert(id, payload);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.deleted.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(NumericId, Bytes)>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect())
    }
}

/// Produces a fresh [`InMemoryBinaryStore`] per partition.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBinaryStoreFactory;

impl InMemoryBinaryStoreFactory {
    /// Create the factory.
    pub fn new() -> Self {
        Self
    }
}

impl BinaryStoreFactory for InMemoryBinaryStoreFactory {
    fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
        Ok(Arc::new(InMemoryBinaryStore::new(partition.to_string())))
    }
}

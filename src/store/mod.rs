//! Binary payload storage keyed by numeric id.
//!
//! A [`BinaryStore`] holds the payloads of one partition tier. Stores are
//! produced per partition by a [`BinaryStoreFactory`] and dropped wholesale
//! with [`BinaryStore::delete`] when the partition is released.

mod caching;
mod memory;
#[cfg(feature = "rocksdb-storage")]
mod persistent;
mod remote;

pub use caching::{CachingBinaryStore, CachingBinaryStoreFactory};
pub use memory::{InMemoryBinaryStore, InMemoryBinaryStoreFactory};
#[cfg(feature = "rocksdb-storage")]
pub use persistent::{RocksDbBinaryStore, RocksDbBinaryStoreFactory, RocksDbEnvironment};
pub use remote::{RemoteBinaryStore, RemoteBinaryStoreFactory};

use crate::error::{Error, Result};
use crate::types::{CachePartitionKey, NumericId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Byte-payload storage for one partition tier.
#[async_trait]
pub trait BinaryStore: Send + Sync + fmt::Debug {
    /// Get the payload stored for an id.
    async fn get(&self, id: NumericId) -> Result<Option<Bytes>>;

    /// Get payloads for many ids; absent ids are simply missing from the map.
    async fn get_many(&self, ids: &[NumericId]) -> Result<HashMap<NumericId, Bytes>> {
        let mut found = HashMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(payload) = self.get(id).await? {
                found.insert(id, payload);
            }
        }
        Ok(found)
    }

    /// Store a payload.
    async fn put(&self, id: NumericId, payload: Bytes) -> Result<()>;

    /// Store many payloads. No cross-entry atomicity is implied.
    async fn put_many(&self, entries: Vec<(NumericId, Bytes)>) -> Result<()> {
        for (id, payload) in entries {
            self.put(id, payload).await?;
        }
        Ok(())
    }

    /// Drop the entire store.
    async fn delete(&self) -> Result<()>;

    /// Snapshot of every stored entry. Backends that cannot enumerate
    /// report [`Error::Unsupported`].
    async fn entries(&self) -> Result<Vec<(NumericId, Bytes)>> {
        Err(Error::Unsupported("binary store enumeration"))
    }
}

/// Creates the store backing one partition tier.
pub trait BinaryStoreFactory: Send + Sync + fmt::Debug {
    /// Create (or reopen) the store for a partition.
    fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>>;
}

/// Identity of a store handle, used to delete shared stores exactly once.
pub(crate) fn store_identity(store: &Arc<dyn BinaryStore>) -> usize {
    Arc::as_ptr(store) as *const () as usize
}

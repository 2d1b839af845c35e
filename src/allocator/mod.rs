//! Identifier virtualization for value keys.
//!
//! An allocator maps each distinct [`ValueKey`] to a compact [`NumericId`].
//! Within one allocator's lifetime the mapping is a bijection: the first
//! caller to ask for a key fixes its id, every later caller (including
//! concurrent racers) observes that same id, and ids are never reused.
//!
//! # Implementations
//!
//! - [`InMemoryIdentifierAllocator`]: atomic counter + concurrent map, no durability
//! - [`RocksDbIdentifierAllocator`]: transactional, survives restart (feature `rocksdb-storage`)
//! - [`CachingIdentifierAllocator`]: bounded local front for a slower allocator
//! - [`RemoteIdentifierAllocator`]: forwards lookups to a cache server

mod caching;
mod memory;
mod remote;
#[cfg(feature = "rocksdb-storage")]
mod persistent;

pub use caching::CachingIdentifierAllocator;
pub use memory::InMemoryIdentifierAllocator;
pub use remote::RemoteIdentifierAllocator;
#[cfg(feature = "rocksdb-storage")]
pub use persistent::RocksDbIdentifierAllocator;

use crate::error::{Error, Result};
use crate::types::{NumericId, ValueKey};
use async_trait::async_trait;
use std::collections::HashMap;

/// Maps value keys to numeric ids.
#[async_trait]
pub trait IdentifierAllocator<K: ValueKey>: Send + Sync {
    /// Get the id for a key, allocating one on first request.
    ///
    /// An id is only returned once it is recorded; persistent
    /// implementations fail with [`Error::Allocation`] otherwise.
    async fn get_id(&self, key: &K) -> Result<NumericId>;

    /// Get ids for many keys. Same per-key semantics as [`get_id`](Self::get_id).
    async fn get_ids(&self, keys: &[K]) -> Result<HashMap<K, NumericId>> {
        let mut ids = HashMap::with_capacity(keys.len());
        for key in keys {
            let id = self.get_id(key).await?;
            ids.insert(key.clone(), id);
        }
        Ok(ids)
    }

    /// Reverse lookup. Backends that cannot answer it report
    /// [`Error::Unsupported`].
    async fn get_key(&self, _id: NumericId) -> Result<Option<K>> {
        Err(Error::Unsupported("reverse identifier lookup"))
    }
}

//! RocksDB-backed identifier allocator.
//!
//! Mappings are written inside a pessimistic transaction together with the
//! "highest allocated id" marker, so a restart resumes allocation above
//! every id ever returned without scanning the mapping table.
//!
//! # Column Family Layout
//!
//! - `keys`: encoded value key -> id (big-endian u64)
//! - `ids`: id (big-endian u64) -> encoded value key
//! - `meta`: allocation marker (versioned keys)
//!
//! Every database call is blocking, so the async entry points run on the
//! blocking thread pool. Allocations of distinct keys all lock the marker,
//! which is why the transaction lock timeout is configurable.

use super::IdentifierAllocator;
use crate::config::RocksDbConfig;
use crate::error::{AllocationError, Error, Result, StoreError};
use crate::metrics::CacheMetrics;
use crate::types::{NumericId, ValueKey};
use async_trait::async_trait;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Options, SingleThreaded, TransactionDB,
    TransactionDBOptions, TransactionOptions, WriteOptions,
};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Column family names
const CF_KEYS: &str = "keys";
const CF_IDS: &str = "ids";
const CF_META: &str = "meta";

/// Highest id ever committed.
const KEY_HIGHEST_ID: &[u8] = b"v1/highest_id";

/// Persistent allocator. Never returns an id that is not durably recorded.
///
/// Cloneable - clones share the same underlying database.
pub struct RocksDbIdentifierAllocator<K: ValueKey> {
    inner: Arc<AllocatorInner>,
    metrics: Arc<CacheMetrics>,
    _marker: PhantomData<fn() -> K>,
}

struct AllocatorInner {
    db: TransactionDB<SingleThreaded>,
    write_opts: WriteOptions,
}

impl<K: ValueKey> Clone for RocksDbIdentifierAllocator<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            metrics: self.metrics.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: ValueKey> RocksDbIdentifierAllocator<K> {
    /// Open (or create) an allocator database.
    pub fn open(config: &RocksDbConfig) -> Result<Self> {
        Self::open_with_metrics(config, Arc::new(CacheMetrics::new()))
    }

    /// Open an allocator database reporting to the given metrics.
    pub fn open_with_metrics(config: &RocksDbConfig, metrics: Arc<CacheMetrics>) -> Result<Self> {
        let path = Path::new(&config.path);

        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);

        let cfs = [CF_KEYS, CF_IDS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout.as_millis() as i64);

        let db = TransactionDB::<SingleThreaded>::open_cf_descriptors(&opts, &txn_db_opts, path, cfs)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);

        let allocator = Self {
            inner: Arc::new(AllocatorInner { db, write_opts }),
            metrics,
            _marker: PhantomData,
        };

        info!(
            path = %config.path,
            highest_id = allocator.highest_id()?,
            "RocksDB identifier allocator opened"
        );

        Ok(allocator)
    }

    /// Highest id recorded so far (0 when nothing has been allocated).
    pub fn highest_id(&self) -> Result<NumericId> {
        let cf = self.cf(CF_META)?;
        match self.inner.db.get_cf(cf, KEY_HIGHEST_ID)? {
            Some(data) => decode_id(&data),
            None => Ok(0),
        }
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.inner
            .db
            .cf_handle(name)
            .ok_or_else(|| StoreError::RocksDb(format!("{} column family not found", name)).into())
    }

    fn lookup(&self, encoded: &[u8]) -> Result<Option<NumericId>> {
        match self.inner.db.get_cf(self.cf(CF_KEYS)?, encoded)? {
            Some(data) => decode_id(&data).map(Some),
            None => Ok(None),
        }
    }

    /// Allocate inside a transaction: re-check the key, then record the
    /// mapping, its reverse and the marker atomically.
    fn allocate(&self, encoded: &[u8]) -> Result<NumericId> {
        let cf_keys = self.cf(CF_KEYS)?;
        let cf_ids = self.cf(CF_IDS)?;
        let cf_meta = self.cf(CF_META)?;

        let txn = self
            .inner
            .db
            .transaction_opt(&self.inner.write_opts, &TransactionOptions::default());

        // Exclusive read: a racer on the same key waits here and then sees our commit.
        let existing = txn
            .get_for_update_cf(cf_keys, encoded, true)
            .map_err(write_failed)?;
        if let Some(data) = existing {
            return decode_id(&data);
        }

        let highest = match txn
            .get_for_update_cf(cf_meta, KEY_HIGHEST_ID, true)
            .map_err(write_failed)?
        {
            Some(data) => decode_id(&data)?,
            None => 0,
        };
        let id = highest.checked_add(1).ok_or(AllocationError::Exhausted)?;
        let id_bytes = id.to_be_bytes();

        txn.put_cf(cf_keys, encoded, id_bytes).map_err(write_failed)?;
        txn.put_cf(cf_ids, id_bytes, encoded).map_err(write_failed)?;
        txn.put_cf(cf_meta, KEY_HIGHEST_ID, id_bytes)
            .map_err(write_failed)?;
        txn.commit().map_err(write_failed)?;

        self.metrics.ids_allocated.inc();
        debug!(id, "Allocated identifier");
        Ok(id)
    }

    fn resolve(&self, key: &K) -> Result<NumericId> {
        let encoded = bincode::serialize(key)?;
        match self.lookup(&encoded)? {
            Some(id) => Ok(id),
            None => self.allocate(&encoded),
        }
    }

    /// Run blocking database work on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || work(&this))
            .await
            .map_err(|e| Error::Internal(format!("allocator task failed: {}", e)))?
    }

    fn reverse(&self, id: NumericId) -> Result<Option<K>> {
        match self.inner.db.get_cf(self.cf(CF_IDS)?, id.to_be_bytes())? {
            Some(data) => bincode::deserialize(&data)
                .map(Some)
                .map_err(|e| AllocationError::Corrupt(e.to_string()).into()),
            None => Ok(None),
        }
    }
}

impl<K: ValueKey> std::fmt::Debug for RocksDbIdentifierAllocator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbIdentifierAllocator")
            .field("highest_id", &self.highest_id().ok())
            .finish()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierAllocator<K> for RocksDbIdentifierAllocator<K> {
    async fn get_id(&self, key: &K) -> Result<NumericId> {
        let key = key.clone();
        self.blocking(move |this| this.resolve(&key)).await
    }

    async fn get_ids(&self, keys: &[K]) -> Result<std::collections::HashMap<K, NumericId>> {
        let keys = keys.to_vec();
        self.blocking(move |this| {
            keys.into_iter()
                .map(|key| this.resolve(&key).map(|id| (key, id)))
                .collect()
        })
        .await
    }

    async fn get_key(&self, id: NumericId) -> Result<Option<K>> {
        self.blocking(move |this| this.reverse(id)).await
    }
}

fn decode_id(data: &[u8]) -> Result<NumericId> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| AllocationError::Corrupt(format!("id of {} bytes", data.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn write_failed(e: rocksdb::Error) -> crate::error::Error {
    AllocationError::WriteFailed(e.into_string()).into()
}

//! RocksDB-backed binary stores.
//!
//! One [`RocksDbEnvironment`] (a single database directory) hosts every
//! partition. Each partition tier gets its own column family, so deleting a
//! store is a single column family drop rather than a range scan.
//!
//! # Column Family Naming
//!
//! `{tier}|{len}:{namespace}|{len}:{configuration}|{generation}`
//!
//! Length prefixes keep names unambiguous whatever characters the namespace
//! or configuration contain. Payloads are keyed by big-endian id.

use super::{BinaryStore, BinaryStoreFactory};
use crate::config::RocksDbConfig;
use crate::error::{Result, StoreError};
use crate::types::{CachePartitionKey, NumericId, Tier};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rocksdb::{
    ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch,
    WriteOptions,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared database environment hosting the column family of every store.
pub struct RocksDbEnvironment {
    db: DBWithThreadMode<MultiThreaded>,
    write_opts: WriteOptions,
    path: String,

    /// Serializes column family creation and removal.
    cf_lock: Mutex<()>,
}

impl RocksDbEnvironment {
    /// Open (or create) the environment, reopening every existing column family.
    pub fn open(config: &RocksDbConfig) -> Result<Arc<Self>> {
        let path = Path::new(&config.path);

        let mut opts = Options::default();
        opts.create_if_missing(config.create_if_missing);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);

        // A fresh directory has no column family list yet.
        let existing = DBWithThreadMode::<MultiThreaded>::list_cf(&opts, path)
            .unwrap_or_else(|_| vec!["default".to_string()]);
        let descriptors = existing
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, descriptors)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.sync_writes);

        info!(
            path = %config.path,
            column_families = existing.len(),
            "RocksDB binary store environment opened"
        );

        Ok(Arc::new(Self {
            db,
            write_opts,
            path: config.path.clone(),
            cf_lock: Mutex::new(()),
        }))
    }

    /// Whether a column family with this name currently exists.
    pub fn has_store(&self, name: &str) -> bool {
        self.db.cf_handle(name).is_some()
    }

    fn ensure_cf(&self, name: &str) -> Result<()> {
        let _guard = self.cf_lock.lock();
        if self.db.cf_handle(name).is_none() {
            self.db.create_cf(name, &Options::default())?;
            debug!(column_family = name, "Created column family");
        }
        Ok(())
    }

    fn drop_cf(&self, name: &str) -> Result<()> {
        let _guard = self.cf_lock.lock();
        if self.db.cf_handle(name).is_some() {
            self.db.drop_cf(name)?;
            debug!(column_family = name, "Dropped column family");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RocksDbEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbEnvironment")
            .field("path", &self.path)
            .finish()
    }
}

/// Column family name for one partition tier.
pub(crate) fn column_family_name(tier: Tier, partition: &CachePartitionKey) -> String {
    format!(
        "{}|{}:{}|{}:{}|{}",
        tier.as_str(),
        partition.namespace.len(),
        partition.namespace,
        partition.configuration.len(),
        partition.configuration,
        partition.generation
    )
}

/// Binary store living in one column family of a [`RocksDbEnvironment`].
///
/// Once deleted, reads miss and writes fail with [`StoreError::Deleted`],
/// even after another handle recreated a column family of the same name.
#[derive(Debug)]
pub struct RocksDbBinaryStore {
    env: Arc<RocksDbEnvironment>,
    cf_name: String,

    /// Set by `delete`; writers hold the read side for the whole write.
    deleted: RwLock<bool>,
}

impl RocksDbBinaryStore {
    /// Open the store for a partition tier, creating its column family if needed.
    pub fn open(env: Arc<RocksDbEnvironment>, tier: Tier, partition: &CachePartitionKey) -> Result<Self> {
        let cf_name = column_family_name(tier, partition);
        env.ensure_cf(&cf_name)?;
        Ok(Self {
            env,
            cf_name,
            deleted: RwLock::new(false),
        })
    }

    pub fn column_family(&self) -> &str {
        &self.cf_name
    }

    fn deleted_error(&self) -> crate::error::Error {
        StoreError::Deleted(self.cf_name.clone()).into()
    }

    fn is_deleted(&self) -> bool {
        *self.deleted.read()
    }

    fn read(&self, id: NumericId) -> Result<Option<Bytes>> {
        if self.is_deleted() {
            return Ok(None);
        }
        let Some(cf) = self.env.db.cf_handle(&self.cf_name) else {
            return Ok(None);
        };
        Ok(self.env.db.get_cf(&cf, id.to_be_bytes())?.map(Bytes::from))
    }

    fn write(&self, entries: &[(NumericId, Bytes)]) -> Result<()> {
        let deleted = self.deleted.read();
        if *deleted {
            return Err(self.deleted_error());
        }
        let cf = self.env.db.cf_handle(&self.cf_name).ok_or_else(|| self.deleted_error())?;
        let mut batch = WriteBatch::default();
        for (id, payload) in entries {
            batch.put_cf(&cf, id.to_be_bytes(), payload);
        }
        self.env.db.write_opt(batch, &self.env.write_opts)?;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(NumericId, Bytes)>> {
        if self.is_deleted() {
            return Ok(Vec::new());
        }
        let Some(cf) = self.env.db.cf_handle(&self.cf_name) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for item in self.env.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let key: [u8; 8] = key[..]
                .try_into()
                .map_err(|_| StoreError::RocksDb(format!("malformed key of {} bytes", key.len())))?;
            entries.push((u64::from_be_bytes(key), Bytes::from(value.into_vec())));
        }
        Ok(entries)
    }
}

#[async_trait]
impl BinaryStore for RocksDbBinaryStore {
    async fn get(&self, id: NumericId) -> Result<Option<Bytes>> {
        self.read(id)
    }

    async fn put(&self, id: NumericId, payload: Bytes) -> Result<()> {
        self.write(&[(id, payload)])
    }

    async fn put_many(&self, entries: Vec<(NumericId, Bytes)>) -> Result<()> {
        self.write(&entries)
    }

    async fn delete(&self) -> Result<()> {
        let mut deleted = self.deleted.write();
        *deleted = true;
        self.env.drop_cf(&self.cf_name)
    }

    async fn entries(&self) -> Result<Vec<(NumericId, Bytes)>> {
        self.scan()
    }
}

/// Produces [`RocksDbBinaryStore`]s for one tier of a shared environment.
#[derive(Debug, Clone)]
pub struct RocksDbBinaryStoreFactory {
    env: Arc<RocksDbEnvironment>,
    tier: Tier,
}

impl RocksDbBinaryStoreFactory {
    pub fn new(env: Arc<RocksDbEnvironment>, tier: Tier) -> Self {
        Self { env, tier }
    }

    /// Column family name this factory uses for a partition.
    pub fn store_name(&self, partition: &CachePartitionKey) -> String {
        column_family_name(self.tier, partition)
    }
}

impl BinaryStoreFactory for RocksDbBinaryStoreFactory {
    fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
        Ok(Arc::new(RocksDbBinaryStore::open(
            self.env.clone(),
            self.tier,
            partition,
        )?))
    }
}

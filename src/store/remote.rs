//! Binary store proxy served by a remote cache server.

use super::{BinaryStore, BinaryStoreFactory};
use crate::error::{Result, StoreError};
use crate::network::RemoteClient;
use crate::types::{CachePartitionKey, NumericId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Forwards every operation for one partition to the server.
///
/// Once this handle deleted the partition it refuses further writes, so a
/// stale handle cannot recreate the partition on the server.
pub struct RemoteBinaryStore {
    partition: CachePartitionKey,
    client: Arc<RemoteClient>,
    deleted: AtomicBool,
}

impl RemoteBinaryStore {
    pub fn new(partition: CachePartitionKey, client: Arc<RemoteClient>) -> Self {
        Self {
            partition,
            client,
            deleted: AtomicBool::new(false),
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn partition(&self) -> &CachePartitionKey {
        &self.partition
    }
}

impl std::fmt::Debug for RemoteBinaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBinaryStore")
            .field("partition", &self.partition)
            .field("server", &self.client.server_addr())
            .finish()
    }
}

#[async_trait]
impl BinaryStore for RemoteBinaryStore {
    async fn get(&self, id: NumericId) -> Result<Option<Bytes>> {
        if self.is_deleted() {
            return Ok(None);
        }
        self.client.get(&self.partition, id).await
    }

    async fn put(&self, id: NumericId, payload: Bytes) -> Result<()> {
        if self.is_deleted() {
            return Err(StoreError::Deleted(self.partition.to_string()).into());
        }
        self.client.put(&self.partition, id, payload).await
    }

    async fn delete(&self) -> Result<()> {
        self.deleted.store(true, Ordering::Release);
        self.client.delete(&self.partition).await
    }
}

/// Produces [`RemoteBinaryStore`]s sharing one client connection.
#[derive(Debug, Clone)]
pub struct RemoteBinaryStoreFactory {
    client: Arc<RemoteClient>,
}

impl RemoteBinaryStoreFactory {
    pub fn new(client: Arc<RemoteClient>) -> Self {
        Self { client }
    }
}

impl BinaryStoreFactory for RemoteBinaryStoreFactory {
    fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
        Ok(Arc::new(RemoteBinaryStore::new(
            partition.clone(),
            self.client.clone(),
        )))
    }
}

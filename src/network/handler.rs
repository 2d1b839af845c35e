//! Server-side dispatch of protocol requests onto local backends.

use crate::allocator::IdentifierAllocator;
use crate::error::Result;
use crate::network::rpc::Message;
use crate::network::server::MessageHandler;
use crate::store::{BinaryStore, BinaryStoreFactory};
use crate::types::{CachePartitionKey, NumericId};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Serves lookups from one allocator and payloads from per-partition stores.
///
/// Keys arrive already serialized, so the allocator works on raw bytes.
/// One store is kept per partition for both tiers of a client.
pub struct CacheServer {
    allocator: Arc<dyn IdentifierAllocator<Vec<u8>>>,
    store_factory: Arc<dyn BinaryStoreFactory>,
    stores: DashMap<CachePartitionKey, Arc<dyn BinaryStore>>,
}

impl CacheServer {
    pub fn new(
        allocator: Arc<dyn IdentifierAllocator<Vec<u8>>>,
        store_factory: Arc<dyn BinaryStoreFactory>,
    ) -> Self {
        Self {
            allocator,
            store_factory,
            stores: DashMap::new(),
        }
    }

    /// Number of partitions with a live store.
    pub fn partition_count(&self) -> usize {
        self.stores.len()
    }

    fn store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
        if let Some(store) = self.stores.get(partition) {
            return Ok(store.clone());
        }
        let store = self
            .stores
            .entry(partition.clone())
            .or_try_insert_with(|| self.store_factory.create_store(partition))?;
        Ok(store.clone())
    }

    async fn lookup(&self, keys: Vec<Vec<u8>>) -> Result<Vec<NumericId>> {
        let mut ids = Vec::with_capacity(keys.len());
        for key in &keys {
            ids.push(self.allocator.get_id(key).await?);
        }
        Ok(ids)
    }

    async fn get(&self, partition: &CachePartitionKey, id: NumericId) -> Result<Option<Bytes>> {
        self.store(partition)?.get(id).await
    }

    async fn put(&self, partition: &CachePartitionKey, id: NumericId, payload: Bytes) -> Result<()> {
        self.store(partition)?.put(id, payload).await
    }

    async fn delete(&self, partition: &CachePartitionKey) -> Result<()> {
        let store = match self.stores.remove(partition) {
            Some((_, store)) => store,
            // Never touched here; the backend may still hold data from an earlier run.
            None => self.store_factory.create_store(partition)?,
        };
        store.delete().await?;
        info!(partition = %partition, "Deleted partition store");
        Ok(())
    }

    async fn dispatch(&self, msg: Message) -> Result<Message> {
        match msg {
            Message::LookupRequest { keys } => {
                let ids = self.lookup(keys).await?;
                Ok(Message::LookupResponse { ids })
            }
            Message::GetRequest { partition, id } => {
                let payload = self.get(&partition, id).await?;
                Ok(Message::GetResponse { payload })
            }
            Message::PutRequest {
                partition,
                id,
                payload,
            } => {
                self.put(&partition, id, payload).await?;
                Ok(Message::Ack)
            }
            Message::DeleteRequest { partition } => {
                self.delete(&partition).await?;
                Ok(Message::Ack)
            }
            other @ (Message::LookupResponse { .. }
            | Message::GetResponse { .. }
            | Message::Ack
            | Message::Failure { .. }) => {
                warn!(kind = other.kind(), "Unexpected message kind, answering with empty ack");
                Ok(Message::Ack)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CacheServer {
    async fn handle(&self, msg: Message) -> Message {
        let kind = msg.kind();
        debug!(kind, "Handling request");
        match self.dispatch(msg).await {
            Ok(response) => response,
            Err(e) => {
                warn!(kind, error = %e, "Request failed");
                Message::Failure {
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::InMemoryIdentifierAllocator;
    use crate::store::InMemoryBinaryStoreFactory;

    fn server() -> CacheServer {
        CacheServer::new(
            Arc::new(InMemoryIdentifierAllocator::<Vec<u8>>::new()),
            Arc::new(InMemoryBinaryStoreFactory::new()),
        )
    }

    #[tokio::test]
    async fn test_lookup_preserves_order() {
        let server = server();
        let response = server
            .handle(Message::LookupRequest {
                keys: vec![b"a".to_vec(), b"b".to_vec(), b"a".to_vec()],
            })
            .await;

        let Message::LookupResponse { ids } = response else {
            panic!("Wrong message type: {:?}", response);
        };
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], ids[2]);
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let server = server();
        let partition = CachePartitionKey::new("ns", "cfg", 1);

        let ack = server
            .handle(Message::PutRequest {
                partition: partition.clone(),
                id: 3,
                payload: Bytes::from("three"),
            })
            .await;
        assert_eq!(ack, Message::Ack);

        let response = server
            .handle(Message::GetRequest {
                partition: partition.clone(),
                id: 3,
            })
            .await;
        assert_eq!(
            response,
            Message::GetResponse {
                payload: Some(Bytes::from("three"))
            }
        );

        server
            .handle(Message::DeleteRequest {
                partition: partition.clone(),
            })
            .await;
        assert_eq!(server.partition_count(), 0);

        let response = server.handle(Message::GetRequest { partition, id: 3 }).await;
        assert_eq!(response, Message::GetResponse { payload: None });
    }

    #[tokio::test]
    async fn test_response_kinds_are_acked() {
        let server = server();
        assert_eq!(
            server.handle(Message::GetResponse { payload: None }).await,
            Message::Ack
        );
        assert_eq!(server.handle(Message::Ack).await, Message::Ack);
    }
}

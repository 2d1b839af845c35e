//! Allocator proxy served by a remote cache server.

use super::IdentifierAllocator;
use crate::error::{AllocationError, Result};
use crate::network::RemoteClient;
use crate::types::{NumericId, ValueKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Forwards lookups to the server's allocator. Holds no local state; put a
/// [`CachingIdentifierAllocator`](super::CachingIdentifierAllocator) in
/// front of it to save round trips.
///
/// Keys travel as their bincode encoding, so the server compares them by
/// bytes. Reverse lookup is not offered.
pub struct RemoteIdentifierAllocator<K: ValueKey> {
    client: Arc<RemoteClient>,
    _marker: PhantomData<fn() -> K>,
}

impl<K: ValueKey> RemoteIdentifierAllocator<K> {
    /// Create a proxy over a connected client.
    pub fn new(client: Arc<RemoteClient>) -> Self {
        Self {
            client,
            _marker: PhantomData,
        }
    }

    fn encode(key: &K) -> Result<Vec<u8>> {
        Ok(bincode::serialize(key)?)
    }
}

impl<K: ValueKey> std::fmt::Debug for RemoteIdentifierAllocator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentifierAllocator")
            .field("server", &self.client.server_addr())
            .finish()
    }
}

#[async_trait]
impl<K: ValueKey> IdentifierAllocator<K> for RemoteIdentifierAllocator<K> {
    async fn get_id(&self, key: &K) -> Result<NumericId> {
        let ids = self.client.lookup(vec![Self::encode(key)?]).await?;
        match ids.as_slice() {
            [id] => Ok(*id),
            _ => Err(AllocationError::ResponseMismatch {
                expected: 1,
                actual: ids.len(),
            }
            .into()),
        }
    }

    async fn get_ids(&self, keys: &[K]) -> Result<HashMap<K, NumericId>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let encoded = keys.iter().map(Self::encode).collect::<Result<Vec<_>>>()?;
        let ids = self.client.lookup(encoded).await?;
        if ids.len() != keys.len() {
            return Err(AllocationError::ResponseMismatch {
                expected: keys.len(),
                actual: ids.len(),
            }
            .into());
        }
        // Parallel arrays: ids[i] answers keys[i].
        Ok(keys.iter().cloned().zip(ids).collect())
    }
}

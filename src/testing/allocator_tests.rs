//! Concurrency tests for identifier allocators.
//!
//! Every allocator must keep the key/id mapping a bijection when many tasks
//! ask for the same fresh keys at once.

#[cfg(test)]
mod tests {
    use crate::allocator::{
        CachingIdentifierAllocator, IdentifierAllocator, InMemoryIdentifierAllocator,
        RemoteIdentifierAllocator,
    };
    use crate::testing::utils::numbered_keys;
    use crate::testing::TestServer;
    use rand::Rng;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use test_log::test;

    /// Run `tasks` concurrent tasks, each doing `lookups` random lookups over `keys`.
    /// Returns every (key, id) answer observed.
    async fn hammer(
        allocator: Arc<dyn IdentifierAllocator<String>>,
        keys: &[String],
        tasks: usize,
        lookups: usize,
    ) -> Vec<(String, u64)> {
        let mut handles = Vec::with_capacity(tasks);
        for _ in 0..tasks {
            let picks: Vec<String> = {
                let mut rng = rand::rng();
                (0..lookups)
                    .map(|_| keys[rng.random_range(0..keys.len())].clone())
                    .collect()
            };
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::with_capacity(picks.len());
                for key in picks {
                    let id = allocator.get_id(&key).await.unwrap();
                    seen.push((key, id));
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all
    }

    /// Every key maps to exactly one id and no two keys share one.
    fn assert_bijection(answers: &[(String, u64)]) -> HashMap<String, u64> {
        let mut mapping: HashMap<String, u64> = HashMap::new();
        for (key, id) in answers {
            let first = *mapping.entry(key.clone()).or_insert(*id);
            assert_eq!(first, *id, "key {} mapped to two ids", key);
        }
        let distinct: HashSet<u64> = mapping.values().copied().collect();
        assert_eq!(distinct.len(), mapping.len(), "two keys share an id");
        mapping
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
    async fn test_random_lookups_over_two_keys() {
        let allocator = Arc::new(InMemoryIdentifierAllocator::<String>::new());
        let keys = vec!["k1".to_string(), "k2".to_string()];

        let answers = hammer(allocator.clone(), &keys, 8, 1000).await;
        assert_eq!(answers.len(), 8000);

        let mapping = assert_bijection(&answers);
        assert_eq!(allocator.len(), 2);
        assert_eq!(
            allocator.get_id(&"k1".to_string()).await.unwrap(),
            mapping["k1"]
        );
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
    async fn test_distinct_keys_get_distinct_ids() {
        let allocator = Arc::new(InMemoryIdentifierAllocator::<String>::new());
        let keys = numbered_keys("key-", 200);

        let answers = hammer(allocator.clone(), &keys, 8, 500).await;
        let mapping = assert_bijection(&answers);

        // Keys no task happened to pick are still unallocated.
        assert_eq!(allocator.len(), mapping.len());
        for key in &keys {
            let id = allocator.get_id(key).await.unwrap();
            if let Some(previous) = mapping.get(key) {
                assert_eq!(id, *previous);
            }
        }
        assert_eq!(allocator.len(), keys.len());
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_caching_front_agrees_with_backend() {
        let backend = Arc::new(InMemoryIdentifierAllocator::<String>::new());
        // Tiny capacity so evictions happen during the run.
        let front = Arc::new(CachingIdentifierAllocator::new(backend.clone(), 8));
        let keys = numbered_keys("k", 64);

        let answers = hammer(front, &keys, 4, 500).await;
        let mapping = assert_bijection(&answers);
        for (key, id) in mapping {
            assert_eq!(backend.get_id(&key).await.unwrap(), id);
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_remote_allocator_bijection() {
        let server = TestServer::start().await.unwrap();
        let client = server.connect().await.unwrap();
        let remote = Arc::new(RemoteIdentifierAllocator::<String>::new(client.clone()));

        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let answers = hammer(remote.clone(), &keys, 4, 100).await;
        let mapping = assert_bijection(&answers);
        assert_eq!(mapping.len(), 3);

        // A second client sees the same ids.
        let other = RemoteIdentifierAllocator::<String>::new(server.connect().await.unwrap());
        let ids = other.get_ids(&keys).await.unwrap();
        assert_eq!(ids, mapping);

        server.shutdown().await;
    }
}

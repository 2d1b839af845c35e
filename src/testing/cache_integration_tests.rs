//! Integration tests for partition caches built by a [`CacheSource`].
//!
//! These tests verify:
//! - Partition isolation across configurations and generations
//! - Release semantics (no resurrection after release)
//! - Write-behind read-your-write and eventual durability
//! - Structured values surviving the codec
//!
//! [`CacheSource`]: crate::cache::CacheSource

#[cfg(test)]
mod tests {
    use crate::allocator::{CachingIdentifierAllocator, InMemoryIdentifierAllocator};
    use crate::cache::CacheSource;
    use crate::codec::BincodeCodec;
    use crate::config::{CacheConfig, WriteBehindConfig};
    use crate::metrics::CacheMetrics;
    use crate::store::{CachingBinaryStoreFactory, InMemoryBinaryStoreFactory};
    use crate::testing::utils::numbered_keys;
    use crate::types::{CacheSelectHint, Tier};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use test_log::test;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Valuation {
        Price(f64),
        Ladder(Vec<(String, f64)>),
        Attributes(BTreeMap<String, String>),
        Failed { reason: String },
    }

    fn int_source() -> CacheSource<String, i64> {
        CacheSource::with_tier_factories(
            Arc::new(InMemoryIdentifierAllocator::<String>::new()),
            Arc::new(InMemoryBinaryStoreFactory::new()),
            Arc::new(InMemoryBinaryStoreFactory::new()),
            Arc::new(BincodeCodec::<i64>::new()),
        )
    }

    #[test(tokio::test)]
    async fn test_release_clears_data() {
        let source = int_source();
        let x = "x".to_string();

        source
            .get_cache("ViewA", "Cfg1", 100)
            .unwrap()
            .put_shared_value(&x, &42)
            .await
            .unwrap();
        source.release_caches("ViewA", 100).await.unwrap();

        let fresh = source.get_cache("ViewA", "Cfg1", 100).unwrap();
        assert_eq!(fresh.get_value(&x).await.unwrap(), None);
    }

    #[test(tokio::test)]
    async fn test_stale_handle_after_release_cannot_resurrect() {
        let source = int_source();
        let x = "x".to_string();

        let stale = source.get_cache("ViewA", "Cfg1", 100).unwrap();
        stale.put_shared_value(&x, &42).await.unwrap();
        source.release_caches("ViewA", 100).await.unwrap();

        let fresh = source.get_cache("ViewA", "Cfg1", 100).unwrap();
        assert!(stale.put_shared_value(&x, &43).await.is_err());
        assert!(stale.put_private_value(&x, &44).await.is_err());
        assert_eq!(fresh.get_value(&x).await.unwrap(), None);
    }

    #[test(tokio::test)]
    async fn test_release_with_pending_write_behind() {
        let metrics = Arc::new(CacheMetrics::new());
        let source = int_source().with_metrics(metrics.clone());
        let cache = source.get_write_behind_cache("ViewA", "Cfg1", 100).unwrap();

        // Nothing yields before the release, so these are still queued.
        let entries: Vec<(String, i64)> = numbered_keys("k", 50)
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k, i as i64))
            .collect();
        cache.put_values(entries.clone(), &CacheSelectHint::all_shared());
        source.release_caches("ViewA", 100).await.unwrap();

        cache.wait_for_pending_writes().await.unwrap();
        assert_eq!(cache.pending_count(), 0);

        let fresh = source.get_cache("ViewA", "Cfg1", 100).unwrap();
        for (key, _) in &entries {
            assert_eq!(fresh.get_value(key).await.unwrap(), None);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.write_behind_pending, 0);
        assert_eq!(
            snapshot.write_behind_flushed + snapshot.write_behind_discarded,
            50
        );
    }

    #[test(tokio::test)]
    async fn test_partition_isolation() {
        let source = int_source();
        let key = "shared-key".to_string();

        let base = source.get_cache("ns", "cfg1", 1).unwrap();
        base.put_shared_value(&key, &1).await.unwrap();
        base.put_private_value(&"private-key".to_string(), &2)
            .await
            .unwrap();

        for (cfg, gen) in [("cfg1", 2), ("cfg2", 1)] {
            let other = source.get_cache("ns", cfg, gen).unwrap();
            assert_eq!(other.get_value(&key).await.unwrap(), None);
            assert_eq!(
                other.get_value(&"private-key".to_string()).await.unwrap(),
                None
            );
        }
        let other_ns = source.get_cache("other", "cfg1", 1).unwrap();
        assert_eq!(other_ns.get_value(&key).await.unwrap(), None);

        assert_eq!(base.get_value(&key).await.unwrap(), Some(1));
    }

    #[test(tokio::test)]
    async fn test_release_spans_configurations() {
        let source = int_source();
        for cfg in ["cfg1", "cfg2", "cfg3"] {
            source
                .get_cache("ViewA", cfg, 5)
                .unwrap()
                .put_shared_value(&"k".to_string(), &5)
                .await
                .unwrap();
        }
        source.release_caches("ViewA", 5).await.unwrap();
        assert_eq!(source.partition_count(), 0);

        for cfg in ["cfg1", "cfg2", "cfg3"] {
            let cache = source.get_cache("ViewA", cfg, 5).unwrap();
            assert_eq!(cache.get_value(&"k".to_string()).await.unwrap(), None);
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_get_cache_creates_once() {
        let source = Arc::new(int_source());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                source.get_cache("ViewA", "Cfg1", 1).unwrap()
            }));
        }
        let mut caches = Vec::new();
        for handle in handles {
            caches.push(handle.await.unwrap());
        }
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
        assert_eq!(source.partition_count(), 1);
    }

    #[test(tokio::test)]
    async fn test_structured_values_round_trip() {
        let config = CacheConfig::default().with_local_capacity(4);
        let source: CacheSource<(String, u32), Valuation> = CacheSource::new(
            Arc::new(CachingIdentifierAllocator::from_config(
                Arc::new(InMemoryIdentifierAllocator::new()),
                &config,
            )),
            Arc::new(CachingBinaryStoreFactory::from_config(
                Arc::new(InMemoryBinaryStoreFactory::new()),
                &config,
            )),
            Arc::new(BincodeCodec::new()),
        )
        .with_config(config);
        let cache = source.get_cache("ViewA", "Cfg1", 1).unwrap();

        let mut attributes = BTreeMap::new();
        attributes.insert("currency".to_string(), "USD".to_string());
        let values = vec![
            (("price".to_string(), 1), Valuation::Price(101.25)),
            (
                ("ladder".to_string(), 2),
                Valuation::Ladder(vec![("1Y".to_string(), 0.01), ("5Y".to_string(), 0.02)]),
            ),
            (("attrs".to_string(), 3), Valuation::Attributes(attributes)),
            (
                ("failed".to_string(), 4),
                Valuation::Failed {
                    reason: "missing market data".to_string(),
                },
            ),
        ];

        cache
            .put_values(&values, &CacheSelectHint::all_shared())
            .await
            .unwrap();
        for (key, value) in &values {
            assert_eq!(cache.get_value(key).await.unwrap().as_ref(), Some(value));
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_write_behind_over_partition() {
        let metrics = Arc::new(CacheMetrics::new());
        let source = CacheSource::with_tier_factories(
            Arc::new(CachingIdentifierAllocator::new(
                Arc::new(InMemoryIdentifierAllocator::<String>::new()),
                1024,
            )),
            Arc::new(InMemoryBinaryStoreFactory::new()),
            Arc::new(InMemoryBinaryStoreFactory::new()),
            Arc::new(BincodeCodec::<i64>::new()),
        )
        .with_metrics(metrics.clone())
        .with_config(
            CacheConfig::default().with_write_behind(WriteBehindConfig::default().with_max_batch_size(32)),
        );

        let underlying = source.get_cache("ViewA", "Cfg1", 1).unwrap();
        let cache = source.get_write_behind_cache("ViewA", "Cfg1", 1).unwrap();

        let keys = numbered_keys("k", 1000);
        let private: Vec<String> = keys.iter().step_by(3).cloned().collect();
        let hint = CacheSelectHint::private_values(private.clone());
        let entries: Vec<(String, i64)> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i as i64))
            .collect();

        cache.put_values(entries.clone(), &hint);
        // Read-your-write holds immediately, flushed or not.
        assert_eq!(cache.get_value(&keys[999]).await.unwrap(), Some(999));

        cache.wait_for_pending_writes().await.unwrap();
        assert_eq!(cache.pending_count(), 0);

        for (key, value) in &entries {
            let tier = hint.tier_for(key);
            assert_eq!(
                underlying.get_value_with_hint(key, tier).await.unwrap(),
                Some(*value)
            );
        }
        assert_eq!(
            underlying
                .get_value_with_hint(&private[0], Tier::Shared)
                .await
                .unwrap(),
            None
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.write_behind_queued, 1000);
        assert_eq!(snapshot.write_behind_flushed, 1000);
        assert_eq!(snapshot.write_behind_pending, 0);
        assert_eq!(snapshot.write_behind_flush_failures, 0);
    }
}

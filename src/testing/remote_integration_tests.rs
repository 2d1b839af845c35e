//! End-to-end tests of the remote cache protocol.
//!
//! Clients and servers talk over real loopback sockets. Covers remote stores
//! behind a [`CacheSource`](crate::cache::CacheSource), failure propagation,
//! response correlation and connection loss.

#[cfg(test)]
mod tests {
    use crate::allocator::{
        CachingIdentifierAllocator, IdentifierAllocator, InMemoryIdentifierAllocator,
        RemoteIdentifierAllocator,
    };
    use crate::cache::CacheSource;
    use crate::codec::BincodeCodec;
    use crate::config::{RemoteConfig, DEFAULT_MAX_MESSAGE_SIZE};
    use crate::error::{Error, NetworkError, Result, StoreError};
    use crate::metrics::CacheMetrics;
    use crate::network::rpc::{read_frame, Message};
    use crate::network::{MessageHandler, NetworkServer, RemoteClient};
    use crate::store::{BinaryStore, BinaryStoreFactory, RemoteBinaryStoreFactory};
    use crate::testing::{wait_for, TestServer};
    use crate::types::{CachePartitionKey, CacheSelectHint};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::net::TcpListener;

    fn remote_source(client: Arc<RemoteClient>) -> CacheSource<String, String> {
        CacheSource::new(
            Arc::new(RemoteIdentifierAllocator::new(client.clone())),
            Arc::new(RemoteBinaryStoreFactory::new(client)),
            Arc::new(BincodeCodec::new()),
        )
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_remote_cache_visible_to_other_clients() {
        let server = TestServer::start().await.unwrap();
        let writer = remote_source(server.connect().await.unwrap());
        let reader = remote_source(server.connect().await.unwrap());

        let entries: Vec<(String, String)> = (0..20)
            .map(|i| (format!("k{}", i), format!("value-{}", i)))
            .collect();
        writer
            .get_cache("ViewA", "Cfg1", 7)
            .unwrap()
            .put_values(&entries, &CacheSelectHint::all_shared())
            .await
            .unwrap();

        let cache = reader.get_cache("ViewA", "Cfg1", 7).unwrap();
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        let found = cache.get_values(&keys).await.unwrap();
        for ((key, value), (expected_key, expected)) in found.iter().zip(&entries) {
            assert_eq!(key, expected_key);
            assert_eq!(value.as_ref(), Some(expected));
        }
        assert_eq!(server.handler().partition_count(), 1);

        server.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_release_deletes_server_partition() {
        let server = TestServer::start().await.unwrap();
        let client = server.connect().await.unwrap();
        let source = remote_source(client.clone());
        let x = "x".to_string();

        source
            .get_cache("ViewA", "Cfg1", 100)
            .unwrap()
            .put_shared_value(&x, &"42".to_string())
            .await
            .unwrap();
        source.release_caches("ViewA", 100).await.unwrap();
        assert_eq!(server.handler().partition_count(), 0);

        // A client that never saw the partition finds nothing either.
        let other = remote_source(server.connect().await.unwrap());
        let cache = other.get_cache("ViewA", "Cfg1", 100).unwrap();
        assert_eq!(cache.get_value(&x).await.unwrap(), None);

        server.shutdown().await;
    }

    #[derive(Debug)]
    struct BrokenFactory;

    impl BinaryStoreFactory for BrokenFactory {
        fn create_store(&self, partition: &CachePartitionKey) -> Result<Arc<dyn BinaryStore>> {
            Err(StoreError::Io(format!("no volume for {}", partition)).into())
        }
    }

    #[test(tokio::test)]
    async fn test_server_failure_becomes_remote_error() {
        let server = TestServer::start_with(
            Arc::new(InMemoryIdentifierAllocator::<Vec<u8>>::new()),
            Arc::new(BrokenFactory),
        )
        .await
        .unwrap();
        let client = server.connect().await.unwrap();
        let partition = CachePartitionKey::new("ViewA", "Cfg1", 1);

        let err = client
            .put(&partition, 1, Bytes::from_static(b"payload"))
            .await
            .unwrap_err();
        match err {
            Error::Remote(message) => assert!(message.contains("no volume"), "{}", message),
            other => panic!("expected remote error, got {:?}", other),
        }

        // The connection survives a failed request.
        assert_eq!(client.lookup(vec![b"k".to_vec()]).await.unwrap().len(), 1);
        assert!(!client.is_closed());

        server.shutdown().await;
    }

    /// Answers `GetRequest`s with the id as payload, slowest for the smallest id.
    struct SlowEcho;

    #[async_trait]
    impl MessageHandler for SlowEcho {
        async fn handle(&self, msg: Message) -> Message {
            match msg {
                Message::GetRequest { id, .. } => {
                    tokio::time::sleep(Duration::from_millis(5 * (10 - id.min(10)))).await;
                    Message::GetResponse {
                        payload: Some(Bytes::from(id.to_le_bytes().to_vec())),
                    }
                }
                _ => Message::Ack,
            }
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_out_of_order_responses_match_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, shutdown_tx) = NetworkServer::new(addr, Arc::new(SlowEcho));
        let server_task = tokio::spawn(server.serve(listener));

        let metrics = Arc::new(CacheMetrics::new());
        let client = RemoteClient::connect_with_metrics(RemoteConfig::new(addr), metrics.clone())
            .await
            .unwrap();
        let partition = CachePartitionKey::new("ns", "cfg", 1);

        let mut handles = Vec::new();
        for id in 0..10u64 {
            let client = client.clone();
            let partition = partition.clone();
            handles.push(tokio::spawn(async move {
                (id, client.get(&partition, id).await.unwrap())
            }));
        }
        for handle in handles {
            let (id, payload) = handle.await.unwrap();
            assert_eq!(payload.unwrap().as_ref(), &id.to_le_bytes());
        }

        assert_eq!(client.pending_count(), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.remote_requests, 10);
        assert_eq!(snapshot.remote_responses, 10);
        assert_eq!(snapshot.remote_unmatched_responses, 0);
        assert_eq!(metrics.remote_requests.get("get_request"), 10);

        let _ = shutdown_tx.send(()).await;
        let _ = server_task.await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_connection_loss_releases_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept one connection, swallow one request, then hang up.
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await.unwrap();
            assert!(frame.is_some());
        });

        let client = RemoteClient::connect(RemoteConfig::new(addr)).await.unwrap();
        let err = client.lookup(vec![b"k".to_vec()]).await.unwrap_err();
        assert!(
            matches!(err, Error::Network(NetworkError::ConnectionClosed)),
            "{:?}",
            err
        );
        peer.await.unwrap();

        assert!(wait_for(|| client.is_closed(), Duration::from_secs(5)).await);
        assert_eq!(client.pending_count(), 0);

        // Later requests fail fast instead of hanging.
        let err = client
            .get(&CachePartitionKey::new("ns", "cfg", 1), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)), "{:?}", err);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_abandoned_request_releases_waiter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Read requests forever without answering any of them.
        let peer = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(_)) = read_frame(&mut stream, DEFAULT_MAX_MESSAGE_SIZE).await {}
        });

        let client = RemoteClient::connect(RemoteConfig::new(addr)).await.unwrap();
        let partition = CachePartitionKey::new("ns", "cfg", 1);
        for id in 0..5 {
            let result = tokio::time::timeout(Duration::from_millis(50), client.get(&partition, id)).await;
            assert!(result.is_err(), "silent peer answered request {}", id);
        }

        assert_eq!(client.pending_count(), 0);
        assert!(!client.is_closed());
        peer.abort();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_caching_allocator_over_remote() {
        let server = TestServer::start().await.unwrap();
        let metrics = Arc::new(CacheMetrics::new());
        let client = RemoteClient::connect_with_metrics(
            RemoteConfig::new(server.addr()),
            metrics.clone(),
        )
        .await
        .unwrap();
        let allocator = CachingIdentifierAllocator::new(
            Arc::new(RemoteIdentifierAllocator::<String>::new(client)),
            128,
        );

        let first = allocator.get_id(&"k1".to_string()).await.unwrap();
        for _ in 0..10 {
            assert_eq!(allocator.get_id(&"k1".to_string()).await.unwrap(), first);
        }
        // Only the first lookup reached the server.
        assert_eq!(metrics.remote_requests.get("lookup_request"), 1);

        server.shutdown().await;
    }
}

//! Partitioned value cache for view computation engines.
//!
//! Calculation nodes publish computed values into a cache partition keyed by
//! (namespace, configuration, generation) and read back values computed by
//! other nodes. This crate provides:
//! - **Identifier allocators** mapping structured value keys to compact
//!   numeric ids (in-memory, RocksDB, moka-fronted, remote)
//! - **Binary stores** holding encoded payloads per partition tier
//! - A **cache facade** with private and shared tiers and a pluggable codec
//! - A **write-behind** decorator committing puts in the background
//! - A **remote protocol** so many processes can share one cache server
//!
//! # Example
//!
//! ```rust,no_run
//! use viewcache::{
//!     BincodeCodec, CacheSource, CachingBinaryStoreFactory, InMemoryBinaryStoreFactory,
//!     InMemoryIdentifierAllocator, WriteBehindCache, WriteBehindConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source: CacheSource<String, f64> = CacheSource::new(
//!         Arc::new(InMemoryIdentifierAllocator::new()),
//!         Arc::new(CachingBinaryStoreFactory::new(
//!             Arc::new(InMemoryBinaryStoreFactory::new()),
//!             10_000,
//!         )),
//!         Arc::new(BincodeCodec::new()),
//!     );
//!
//!     // One cache per (namespace, configuration, generation).
//!     let cache = source.get_cache("ViewA", "Default", 1)?;
//!     cache.put_shared_value(&"EUR/USD".to_string(), &1.0842).await?;
//!     assert_eq!(cache.get_value(&"EUR/USD".to_string()).await?, Some(1.0842));
//!
//!     // Puts return immediately; commits happen in the background.
//!     let buffered = WriteBehindCache::new(cache, WriteBehindConfig::default())?;
//!     buffered.put_private_value("GBP/USD".to_string(), 1.2671);
//!     buffered.wait_for_pending_writes().await?;
//!
//!     // Drop every configuration of generation 1.
//!     source.release_caches("ViewA", 1).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │      WriteBehindCache (optional)             │
//! └──────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌──────────────────────────────────────────────┐
//! │  CacheSource  ──►  ViewComputationCache      │
//! │  get_cache / release_caches / clone_cache    │
//! └──────────────────────────────────────────────┘
//!          │                        │
//!          ▼                        ▼
//! ┌──────────────────┐   ┌──────────────────────┐
//! │ IdentifierAlloc. │   │ BinaryStore          │
//! │ key -> id        │   │ (private, shared)    │
//! └──────────────────┘   └──────────────────────┘
//!          │                        │
//!          └────────┬───────────────┘
//!                   ▼
//!     memory │ RocksDB │ remote (RemoteClient)
//! ```
//!
//! # Remote Protocol
//!
//! Remote allocators and stores share one [`RemoteClient`] connection per
//! server. Requests carry a correlation id, so any number may be in flight
//! and responses may arrive in any order. Serve a cache with
//! [`NetworkServer`] and a [`CacheServer`] handler.

pub mod allocator;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use cache::{CacheSource, ViewComputationCache, WriteBehindCache};
pub use codec::{BincodeCodec, ValueCodec};
pub use config::{CacheConfig, RemoteConfig, RocksDbConfig, WriteBehindConfig};
pub use error::{AllocationError, Error, NetworkError, Result, StoreError};
pub use types::{CachePartitionKey, CacheSelectHint, CacheStats, NumericId, Tier, ValueKey};

// Re-export allocator types
pub use allocator::{
    CachingIdentifierAllocator, IdentifierAllocator, InMemoryIdentifierAllocator,
    RemoteIdentifierAllocator,
};
#[cfg(feature = "rocksdb-storage")]
pub use allocator::RocksDbIdentifierAllocator;

// Re-export store types
pub use store::{
    BinaryStore, BinaryStoreFactory, CachingBinaryStore, CachingBinaryStoreFactory,
    InMemoryBinaryStore, InMemoryBinaryStoreFactory, RemoteBinaryStore, RemoteBinaryStoreFactory,
};
#[cfg(feature = "rocksdb-storage")]
pub use store::{RocksDbBinaryStore, RocksDbBinaryStoreFactory, RocksDbEnvironment};

// Re-export metrics types
pub use metrics::{CacheMetrics, Counter, Gauge, LabeledCounter, MetricsSnapshot};

// Re-export network types
pub use network::{CacheServer, Envelope, Message, MessageHandler, NetworkServer, RemoteClient};

// Re-export testing types
pub use testing::TestServer;

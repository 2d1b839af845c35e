//! Configuration types for the view computation cache.

use std::net::SocketAddr;
use std::time::Duration;

/// Default upper bound for a single framed message (16MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration for cache construction.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held by local caching decorators.
    pub local_capacity: u64,

    /// Write-behind configuration.
    pub write_behind: WriteBehindConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: 100_000,
            write_behind: WriteBehindConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local cache capacity.
    pub fn with_local_capacity(mut self, capacity: u64) -> Self {
        self.local_capacity = capacity;
        self
    }

    /// Set write-behind configuration.
    pub fn with_write_behind(mut self, write_behind: WriteBehindConfig) -> Self {
        self.write_behind = write_behind;
        self
    }
}

/// Write-behind configuration.
#[derive(Debug, Clone)]
pub struct WriteBehindConfig {
    /// Maximum number of items committed by one batched put.
    pub max_batch_size: usize,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1024,
        }
    }
}

impl WriteBehindConfig {
    /// Set the maximum batch size. Values below 1 are treated as 1.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }
}

/// Remote protocol configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Address of the cache server.
    pub server_addr: SocketAddr,

    /// Largest frame accepted in either direction.
    pub max_message_size: usize,

    /// Timeout for establishing the connection. Requests have no timeout.
    pub connect_timeout: Duration,
}

impl RemoteConfig {
    /// Create a configuration for the given server address.
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Configuration for RocksDB-backed allocators and stores.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Path to the RocksDB database directory.
    pub path: String,

    /// Whether to sync writes to disk immediately.
    pub sync_writes: bool,

    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// Maximum number of open files for RocksDB.
    pub max_open_files: i32,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// How long an allocation transaction waits for a row lock held by a
    /// concurrent allocation before failing.
    pub lock_timeout: Duration,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "viewcache-data".to_string(),
            sync_writes: true,
            create_if_missing: true,
            max_open_files: 1000,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl RocksDbConfig {
    /// Create a new config with the specified path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set whether to sync writes.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the transaction lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

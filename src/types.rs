//! Core types used throughout the view computation cache.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

/// Compact surrogate assigned to a value key by an identifier allocator.
pub type NumericId = u64;

/// Opaque, structurally comparable identifier for a cacheable artifact.
///
/// Keys must be immutable once handed to the cache, and their serialized
/// form must be deterministic: the remote and persistent allocators compare
/// keys by their encoded bytes.
pub trait ValueKey:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ValueKey for T where
    T: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Identifies one logical cache instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CachePartitionKey {
    /// Namespace, typically the owning view process.
    pub namespace: String,
    /// Calculation configuration name.
    pub configuration: String,
    /// Generation (snapshot/cycle) number.
    pub generation: i64,
}

impl CachePartitionKey {
    /// Create a new partition key.
    pub fn new(namespace: impl Into<String>, configuration: impl Into<String>, generation: i64) -> Self {
        Self {
            namespace: namespace.into(),
            configuration: configuration.into(),
            generation,
        }
    }

    /// Whether this partition belongs to the given (namespace, generation) pair.
    pub fn belongs_to(&self, namespace: &str, generation: i64) -> bool {
        self.generation == generation && self.namespace == namespace
    }
}

impl fmt::Display for CachePartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.configuration, self.generation)
    }
}

/// Visibility tier a value is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Visible only to the node that produced it.
    Private,
    /// Visible to every consumer of the partition.
    Shared,
}

impl Tier {
    /// Stable lowercase name, used for store naming and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Private => "private",
            Tier::Shared => "shared",
        }
    }
}

/// Caller-supplied hint deciding, per key, which tier a value lives in.
///
/// The hint names a set of keys and a polarity: either the named keys are
/// private and everything else shared, or the reverse.
#[derive(Debug, Clone)]
pub struct CacheSelectHint<K: ValueKey> {
    keys: HashSet<K>,
    keys_are_private: bool,
}

impl<K: ValueKey> CacheSelectHint<K> {
    /// Every value goes to the private tier.
    pub fn all_private() -> Self {
        Self {
            keys: HashSet::new(),
            keys_are_private: false,
        }
    }

    /// Every value goes to the shared tier.
    pub fn all_shared() -> Self {
        Self {
            keys: HashSet::new(),
            keys_are_private: true,
        }
    }

    /// The named keys are private, all others shared.
    pub fn private_values(keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            keys_are_private: true,
        }
    }

    /// The named keys are shared, all others private.
    pub fn shared_values(keys: impl IntoIterator<Item = K>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            keys_are_private: false,
        }
    }

    /// Resolve the tier for a key.
    pub fn tier_for(&self, key: &K) -> Tier {
        if self.keys.contains(key) == self.keys_are_private {
            Tier::Private
        } else {
            Tier::Shared
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in the local cache.
    pub entry_count: u64,
    /// Number of local cache hits.
    pub hits: u64,
    /// Number of local cache misses.
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

//! Scoped key/value caching for listings, metadata and small file reads.
//!
//! Every cached value lives in a [`CacheScope`], so a listing of `a` and the
//! metadata of `a` never collide. Entries leave the cache by TTL expiry, by
//! explicit invalidation of one key, or by a full [`Cache::flush`].
//!
//! [`CacheValue::NotFound`] is the negative-cache marker: "this path was
//! looked up and did not exist".

mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::backend::Metadata;

pub use memory::{CacheStats, DEFAULT_MAX_CAPACITY, DEFAULT_NEGATIVE_TTL, DEFAULT_TTL, MemoryCache};

/// Namespaces of cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    /// Listings served by the rich client
    List,
    /// Metadata served by the rich client and the overlay
    Metadata,
    /// Decrypted listings inside the encryption overlay
    EncList,
    /// Whole small files
    ReadFile,
}

impl CacheScope {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheScope::List => "list",
            CacheScope::Metadata => "metadata",
            CacheScope::EncList => "enc_list",
            CacheScope::ReadFile => "read_file",
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheValue {
    Listing(Vec<Metadata>),
    Metadata(Metadata),
    Bytes(Bytes),
    /// Negative entry: the key was looked up and does not exist
    NotFound,
}

/// Shared cache used by clients and the overlay. Safe for concurrent use.
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    async fn get(&self, scope: CacheScope, key: &str) -> Option<CacheValue>;

    async fn set(&self, scope: CacheScope, key: &str, value: CacheValue);

    async fn invalidate(&self, scope: CacheScope, key: &str);

    /// Drop every entry in every scope.
    async fn flush(&self);
}

impl dyn Cache {
    /// View of this cache restricted to one scope.
    pub fn scoped(&self, scope: CacheScope) -> ScopedCache<'_> {
        ScopedCache { cache: self, scope }
    }
}

/// A [`Cache`] bound to one [`CacheScope`].
#[derive(Debug, Clone, Copy)]
pub struct ScopedCache<'a> {
    cache: &'a dyn Cache,
    scope: CacheScope,
}

impl ScopedCache<'_> {
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.cache.get(self.scope, key).await
    }

    pub async fn set(&self, key: &str, value: CacheValue) {
        self.cache.set(self.scope, key, value).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(self.scope, key).await;
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }
}

/// Cache that stores nothing; every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCache;

#[async_trait]
impl Cache for DisabledCache {
    async fn get(&self, _scope: CacheScope, _key: &str) -> Option<CacheValue> {
        None
    }

    async fn set(&self, _scope: CacheScope, _key: &str, _value: CacheValue) {}

    async fn invalidate(&self, _scope: CacheScope, _key: &str) {}

    async fn flush(&self) {}
}

fn default_enabled() -> bool {
    true
}

fn default_ttl() -> Duration {
    DEFAULT_TTL
}

fn default_negative_ttl() -> Duration {
    DEFAULT_NEGATIVE_TTL
}

fn default_max_capacity() -> u64 {
    DEFAULT_MAX_CAPACITY
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(default = "default_negative_ttl", with = "humantime_serde")]
    pub negative_ttl: Duration,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl: DEFAULT_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            max_capacity: DEFAULT_MAX_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Build the cache these settings describe.
    pub fn build(&self) -> Arc<dyn Cache> {
        if self.enabled {
            Arc::new(MemoryCache::new(self.ttl, self.negative_ttl, self.max_capacity))
        } else {
            Arc::new(DisabledCache)
        }
    }
}

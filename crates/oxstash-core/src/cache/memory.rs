//! In-process TTL cache backed by Moka.
//!
//! Two Moka caches sit behind one [`MemoryCache`]:
//!
//! - a positive cache holding [`CachedEntry`] values with a per-entry TTL
//!   (via Moka's `Expiry` trait);
//! - a negative cache of keys known not to exist, with its own, shorter TTL.
//!
//! Storing a positive value clears any negative entry for the same key, and
//! storing [`CacheValue::NotFound`] clears any positive one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::Expiry;
use tracing::trace;

use super::{Cache, CacheScope, CacheValue};

/// Default time-to-live for cached entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Default time-to-live for negative cache entries.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// Default maximum number of positive entries.
pub const DEFAULT_MAX_CAPACITY: u64 = 50_000;

/// Negative entries are tiny; cap them separately.
const NEGATIVE_MAX_CAPACITY: u64 = 10_000;

type CacheKey = (CacheScope, String);

/// A cached value together with its TTL.
#[derive(Debug, Clone)]
struct CachedEntry {
    value: CacheValue,
    ttl: Duration,
}

/// Expiry implementation that uses the per-entry TTL from [`CachedEntry`].
struct PerEntryExpiry;

impl Expiry<CacheKey, CachedEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CachedEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    flushes: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn negative_hits(&self) -> u64 {
        self.negative_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Hit rate over all lookups (0.0 when nothing was looked up yet).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() + self.negative_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Thread-safe async TTL cache with negative caching.
#[derive(Clone)]
pub struct MemoryCache {
    positive: moka::future::Cache<CacheKey, CachedEntry>,
    negative: moka::future::Cache<CacheKey, ()>,
    ttl: Duration,
    stats: Arc<CacheStats>,
}

impl MemoryCache {
    pub fn new(ttl: Duration, negative_ttl: Duration, max_capacity: u64) -> Self {
        Self {
            positive: moka::future::Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryExpiry)
                .build(),
            negative: moka::future::Cache::builder()
                .max_capacity(NEGATIVE_MAX_CAPACITY)
                .time_to_live(negative_ttl)
                .build(),
            ttl,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_NEGATIVE_TTL, DEFAULT_MAX_CAPACITY)
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a value with a TTL other than the default.
    pub async fn set_with_ttl(&self, scope: CacheScope, key: &str, value: CacheValue, ttl: Duration) {
        let cache_key = (scope, key.to_string());
        if value == CacheValue::NotFound {
            self.positive.invalidate(&cache_key).await;
            self.negative.insert(cache_key, ()).await;
        } else {
            self.negative.invalidate(&cache_key).await;
            self.positive.insert(cache_key, CachedEntry { value, ttl }).await;
        }
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate number of live entries (positive and negative).
    pub async fn entry_count(&self) -> u64 {
        self.positive.run_pending_tasks().await;
        self.negative.run_pending_tasks().await;
        self.positive.entry_count() + self.negative.entry_count()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.positive.entry_count())
            .field("negative_entries", &self.negative.entry_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, scope: CacheScope, key: &str) -> Option<CacheValue> {
        let cache_key = (scope, key.to_string());
        if self.negative.get(&cache_key).await.is_some() {
            self.stats.negative_hits.fetch_add(1, Ordering::Relaxed);
            trace!(%scope, key, "Negative cache hit");
            return Some(CacheValue::NotFound);
        }
        match self.positive.get(&cache_key).await {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                trace!(%scope, key, "Cache hit");
                Some(entry.value)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, scope: CacheScope, key: &str, value: CacheValue) {
        self.set_with_ttl(scope, key, value, self.ttl).await;
    }

    async fn invalidate(&self, scope: CacheScope, key: &str) {
        let cache_key = (scope, key.to_string());
        self.positive.invalidate(&cache_key).await;
        self.negative.invalidate(&cache_key).await;
    }

    async fn flush(&self) {
        self.positive.invalidate_all();
        self.negative.invalidate_all();
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        trace!("Cache flushed");
    }
}

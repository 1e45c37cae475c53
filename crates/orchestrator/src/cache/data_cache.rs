//! In-memory TTL cache with jitter and negative entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::ttl::{apply_jitter, CacheConfig};
use crate::models::{CacheKey, Payload, SourceName};

#[derive(Clone, Debug)]
struct CacheEntry {
    payload: Payload,
    created_at: Instant,
    /// Jittered TTL actually applied to this entry.
    ttl: Duration,
    is_negative: bool,
    source: Option<SourceName>,
    stored_at: DateTime<Utc>,
    /// Why the fetch failed, for negative entries.
    reason: Option<String>,
}

impl CacheEntry {
    /// Lifetime left at `now`. Measured from `created_at` so a huge TTL
    /// never has to be added to an `Instant`.
    fn remaining(&self, now: Instant) -> Duration {
        self.ttl.saturating_sub(now.saturating_duration_since(self.created_at))
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    fn lookup(&self) -> CacheLookup {
        if self.is_negative {
            CacheLookup::NegativeHit {
                reason: self.reason.clone().unwrap_or_default(),
            }
        } else {
            CacheLookup::Hit(CachedPayload {
                payload: self.payload.clone(),
                source: self.source.clone(),
                stored_at: self.stored_at,
                ttl: self.ttl,
            })
        }
    }
}

/// A live positive entry.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedPayload {
    pub payload: Payload,
    /// Provider that produced the payload.
    pub source: Option<SourceName>,
    /// Wall-clock time of the write.
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

/// Result of a cache read.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    Hit(CachedPayload),
    /// A recent fetch for this key exhausted every source.
    NegativeHit { reason: String },
    Miss,
}

impl CacheLookup {
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub size: usize,
    /// Entries removed because they expired or the cache was full.
    pub evictions: u64,
}

impl CacheStats {
    /// Share of reads answered from the cache, negative hits included.
    pub fn hit_rate(&self) -> f64 {
        let answered = self.hits + self.negative_hits;
        let total = answered + self.misses;
        if total == 0 {
            0.0
        } else {
            answered as f64 / total as f64
        }
    }
}

/// TTL-keyed store shared by every fetch.
///
/// Entries expire lazily on read, through [`sweep`](Self::sweep), or by
/// capacity eviction when `max_entries` is set. Reads and writes touch a
/// single shard of the map, so lookups for unrelated keys never block each
/// other.
pub struct DataCache {
    entries: DashMap<CacheKey, CacheEntry>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    evictions: AtomicU64,
}

impl DataCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a key, dropping it if it has expired.
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let now = Instant::now();
        let state = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.lookup()));

        match state {
            Some(Some(lookup)) => {
                match lookup {
                    CacheLookup::Hit(_) => self.hits.fetch_add(1, Ordering::Relaxed),
                    _ => self.negative_hits.fetch_add(1, Ordering::Relaxed),
                };
                lookup
            }
            Some(None) => {
                // Another writer may have refreshed the entry in between.
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired(now))
                    .is_some()
                {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache: expired entry for '{}' removed on read", key);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    /// Look up a key without touching counters or removing expired entries.
    pub fn peek(&self, key: &CacheKey) -> CacheLookup {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.lookup())
            .unwrap_or(CacheLookup::Miss)
    }

    /// Store a payload.
    ///
    /// The TTL is `ttl` when given, otherwise the category default; either
    /// way it is jittered. Replaces any entry for the key, negative or not.
    pub fn set(
        &self,
        key: CacheKey,
        payload: Payload,
        ttl: Option<Duration>,
        source: Option<SourceName>,
    ) {
        let base = ttl.unwrap_or_else(|| self.config.ttl_for(&key.category));
        let ttl = apply_jitter(base, self.config.jitter_ratio);
        debug!("Cache: storing '{}' for {:?}", key, ttl);

        self.insert(
            key,
            CacheEntry {
                payload,
                created_at: Instant::now(),
                ttl,
                is_negative: false,
                source,
                stored_at: Utc::now(),
                reason: None,
            },
        );
    }

    /// Record that a key could not be fetched from any source.
    pub fn set_negative(&self, key: CacheKey, reason: impl Into<String>) {
        let ttl = apply_jitter(self.config.negative_ttl, self.config.jitter_ratio);
        debug!("Cache: storing negative entry for '{}' for {:?}", key, ttl);

        self.insert(
            key,
            CacheEntry {
                payload: Payload::Null,
                created_at: Instant::now(),
                ttl,
                is_negative: true,
                source: None,
                stored_at: Utc::now(),
                reason: Some(reason.into()),
            },
        );
    }

    /// Remove one key. Returns whether an entry existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key of a category. Returns the number removed.
    pub fn invalidate_category(&self, category: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = key.category != category;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Cache: sweep removed {} expired entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            size: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Start a background task that sweeps expired entries every `interval`.
    ///
    /// The task holds only a weak reference; it ends when the cache is
    /// dropped or when the returned handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        // `interval` panics on zero.
        let interval = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                    }
                    None => break,
                }
            }
        });
        SweeperHandle { handle }
    }

    fn insert(&self, key: CacheKey, entry: CacheEntry) {
        if let Some(max_entries) = self.config.max_entries {
            if !self.entries.contains_key(&key) && self.entries.len() >= max_entries {
                self.make_room(max_entries);
            }
        }
        self.entries.insert(key, entry);
    }

    /// Sweep, then evict the entries closest to expiry until one slot is free.
    fn make_room(&self, max_entries: usize) {
        self.sweep();
        let now = Instant::now();
        while self.entries.len() >= max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| entry.remaining(now))
                .map(|entry| entry.key().clone());

            let Some(victim) = victim else {
                break;
            };
            if self.entries.remove(&victim).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Cache: evicted '{}' to stay under {} entries", victim, max_entries);
            }
        }
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::models::Category;

    fn exact_config() -> CacheConfig {
        CacheConfig {
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    fn key(category: &'static str, key: &str) -> CacheKey {
        CacheKey::new(category, key)
    }

    #[test]
    fn test_set_get_with_provenance() {
        let cache = DataCache::new();
        cache.set(
            key("price", "AAPL"),
            json!({"price": 187.2}),
            None,
            Some(SourceName::Borrowed("B")),
        );

        match cache.get(&key("price", "AAPL")) {
            CacheLookup::Hit(hit) => {
                assert_eq!(hit.payload, json!({"price": 187.2}));
                assert_eq!(hit.source.as_deref(), Some("B"));
                assert!(hit.ttl >= Duration::from_millis(26_999));
                assert!(hit.ttl <= Duration::from_millis(33_001));
            }
            other => panic!("expected hit, got {:?}", other),
        }
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_counts() {
        let cache = DataCache::new();
        assert!(cache.get(&key("price", "NONE")).is_miss());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_same_key_different_category_is_distinct() {
        let cache = DataCache::new();
        cache.set(key("price", "X"), json!(1), None, None);

        assert!(cache.get(&key("news", "X")).is_miss());
        assert!(!cache.get(&key("price", "X")).is_miss());
    }

    #[test]
    fn test_expired_entry_is_removed_on_read() {
        let cache = DataCache::with_config(exact_config());
        cache.set(key("price", "A"), json!(1), Some(Duration::from_millis(10)), None);

        std::thread::sleep(Duration::from_millis(20));

        // Peek reports a miss but leaves the entry for the read to remove.
        assert!(cache.peek(&key("price", "A")).is_miss());
        assert_eq!(cache.len(), 1);

        assert!(cache.get(&key("price", "A")).is_miss());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = DataCache::with_config(exact_config());
        cache.set(key("price", "A"), json!(1), Some(Duration::ZERO), None);
        assert!(cache.get(&key("price", "A")).is_miss());
    }

    #[test]
    fn test_negative_entry() {
        let cache = DataCache::new();
        cache.set_negative(key("price", "DEAD"), "all sources exhausted");

        assert_eq!(
            cache.get(&key("price", "DEAD")),
            CacheLookup::NegativeHit {
                reason: "all sources exhausted".to_string()
            }
        );
        assert_eq!(cache.stats().negative_hits, 1);

        // A positive write replaces the negative entry.
        cache.set(key("price", "DEAD"), json!(2), None, None);
        assert!(matches!(cache.get(&key("price", "DEAD")), CacheLookup::Hit(_)));
    }

    #[test]
    fn test_invalidate_and_category() {
        let cache = DataCache::new();
        cache.set(key("price", "A"), json!(1), None, None);
        cache.set(key("price", "B"), json!(2), None, None);
        cache.set(key("news", "A"), json!(3), None, None);

        assert!(cache.invalidate(&key("price", "A")));
        assert!(!cache.invalidate(&key("price", "A")));
        assert_eq!(cache.invalidate_category("price"), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = DataCache::with_config(exact_config());
        cache.set(key("price", "SHORT"), json!(1), Some(Duration::from_millis(10)), None);
        cache.set(key("price", "LONG"), json!(2), Some(Duration::from_secs(60)), None);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.peek(&key("price", "LONG")).is_miss());
    }

    #[test]
    fn test_capacity_evicts_closest_to_expiry() {
        let cache = DataCache::with_config(CacheConfig {
            max_entries: Some(2),
            ..exact_config()
        });
        cache.set(key("price", "SOON"), json!(1), Some(Duration::from_secs(5)), None);
        cache.set(key("price", "LATER"), json!(2), Some(Duration::from_secs(50)), None);
        cache.set(key("price", "NEW"), json!(3), Some(Duration::from_secs(30)), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&key("price", "SOON")).is_miss());
        assert!(!cache.peek(&key("price", "LATER")).is_miss());
        assert!(!cache.peek(&key("price", "NEW")).is_miss());
        assert_eq!(cache.stats().evictions, 1);

        // Overwriting an existing key never evicts.
        cache.set(key("price", "NEW"), json!(4), None, None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_custom_ttl_table() {
        let cache = DataCache::with_config(CacheConfig {
            ttl_by_category: HashMap::from([(
                Category::Borrowed("weather"),
                Duration::from_secs(7),
            )]),
            ..exact_config()
        });
        cache.set(key("weather", "OSLO"), json!({"t": 3}), None, None);

        match cache.peek(&key("weather", "OSLO")) {
            CacheLookup::Hit(hit) => assert_eq!(hit.ttl, Duration::from_secs(7)),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let cache = DataCache::new();
        let forever = Duration::from_secs(u64::MAX);
        cache.set(key("price", "A"), json!(1), Some(forever), None);
        cache.set(key("price", "B"), json!(2), Some(Duration::MAX), None);

        assert!(!cache.get(&key("price", "A")).is_miss());
        assert!(!cache.get(&key("price", "B")).is_miss());
        assert_eq!(cache.sweep(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let cache = Arc::new(DataCache::with_config(exact_config()));
        cache.set(key("price", "A"), json!(1), Some(Duration::from_millis(5)), None);

        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.is_empty());

        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set(key("price", "B"), json!(2), Some(Duration::from_millis(5)), None);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Nothing sweeps any more; the expired entry is still stored.
        assert_eq!(cache.len(), 1);
    }
}

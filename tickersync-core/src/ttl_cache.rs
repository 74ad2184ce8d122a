//! In-memory TTL cache with capacity-bounded eviction.
//!
//! - Entries expire at `created_at + ttl`; expired entries are never returned
//!   and are removed lazily on read (or eagerly by [`TtlCache::cleanup_expired`]).
//! - At capacity, inserting a new key evicts the entry with the oldest
//!   `created_at`. Access does not refresh an entry's age.
//! - One mutex guards the whole map; no partial mutation is ever visible.
//!
//! [`TtlCache::get_or_set`] is not single-flight: two threads missing on the
//! same key may both run the factory. The last `set` wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// A stored value with its timing metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub ttl: Duration,
    /// Insertion sequence, breaks `created_at` ties during eviction.
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Cache counters plus current shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    pub default_ttl_secs: f64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
}

impl<V> CacheInner<V> {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.created_at, e.seq))
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&oldest);
        self.evictions += 1;
        Some(oldest)
    }
}

/// Thread-safe key/value cache with per-entry expiry.
#[derive(Debug)]
pub struct TtlCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
                sets: 0,
                evictions: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. Expired entries are deleted and count as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.entries.get(key).map(|e| e.is_expired(now)) {
            None => {
                inner.misses += 1;
                debug!(key, "cache miss");
                None
            }
            Some(true) => {
                inner.entries.remove(key);
                inner.misses += 1;
                debug!(key, "cache entry expired");
                None
            }
            Some(false) => {
                inner.hits += 1;
                debug!(key, "cache hit");
                inner.entries.get(key).map(|e| e.value.clone())
            }
        }
    }

    /// Store `value` under `key` for `ttl` (or the default TTL).
    ///
    /// Replacing an existing key never evicts another entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let mut inner = self.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            if let Some(evicted) = inner.evict_oldest() {
                debug!(key = %evicted, "cache evicted oldest entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sets += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                ttl,
                seq,
            },
        );
    }

    /// Remove `key`. Returns true iff an entry existed.
    pub fn delete(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Remove every entry whose key contains `pattern`. Returns the count.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.contains(pattern));
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(pattern, removed, "cache invalidated by pattern");
        }
        removed
    }

    /// Return the cached value, or compute it with `factory` and store it.
    ///
    /// The lock is not held while `factory` runs. Factory errors are returned
    /// and nothing is cached.
    pub fn get_or_set<E, F>(&self, key: &str, factory: F, ttl: Option<Duration>) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = factory()?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Drop all entries. Counters are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Remove expired entries now. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw entry access for diagnostics. Does not touch counters.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.lock().entries.get(key).cloned()
    }

    /// Counters and size. Expired entries are purged first.
    pub fn stats(&self) -> CacheStats {
        let mut inner = self.lock();
        inner.purge_expired(Instant::now());
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            evictions: inner.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            size: inner.entries.len(),
            max_size: self.max_size,
            default_ttl_secs: self.default_ttl.as_secs_f64(),
        }
    }

    pub fn reset_stats(&self) {
        let mut inner = self.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.sets = 0;
        inner.evictions = 0;
    }
}

//! TTL + LRU in-memory cache with size accounting.
//!
//! [`Cache`] is the generic keyed store reused by the router's response cache
//! and the configuration/profile caches. Entries expire after a configurable
//! TTL, are evicted least-recently-used first when the entry or byte budget
//! is exceeded, and carry a JSON-derived size estimate so the byte budget can
//! be enforced without asking callers to measure their values.
//!
//! Expired entries are swept lazily on access and periodically by an optional
//! background task that never keeps the process alive.
//!
//! # Example
//!
//! ```rust
//! use agentmux::cache::{Cache, CacheConfig};
//!
//! let cache: Cache<String, String> = Cache::new(CacheConfig {
//!     max_entries: 2,
//!     ttl_ms: 0, // no expiry
//!     ..CacheConfig::default()
//! });
//!
//! cache.set("a".into(), "1".into());
//! cache.set("b".into(), "2".into());
//! cache.set("c".into(), "3".into()); // evicts "a"
//!
//! assert!(cache.get(&"a".into()).is_none());
//! assert_eq!(cache.get(&"c".into()), Some("3".into()));
//! assert_eq!(cache.stats().evictions, 1);
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Fallback size estimate for values that fail JSON serialisation.
const FALLBACK_ENTRY_BYTES: usize = 1024;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries. Exceeding it evicts LRU entries.
    pub max_entries: usize,
    /// Entry time-to-live in milliseconds. `0` disables expiry.
    pub ttl_ms: u64,
    /// Total byte budget across entries. `0` disables the budget.
    pub max_bytes: usize,
    /// Interval of the periodic expiry sweep. `0` disables the sweep task.
    pub cleanup_interval_ms: u64,
    /// Log every hit/miss/eviction at debug level.
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_ms: 0,
            max_bytes: 0,
            cleanup_interval_ms: 0,
            debug: false,
        }
    }
}

/// Counters reported by [`Cache::stats`].
///
/// `evictions` counts capacity evictions only; entries removed because they
/// expired do not increment it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Successful non-expired lookups.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Insertions accepted by [`Cache::set`].
    pub sets: u64,
    /// Entries removed to make room (capacity evictions only).
    pub evictions: u64,
    /// Live entry count at the time of the call.
    pub entries: usize,
    /// Estimated bytes held by live entries.
    pub bytes: usize,
    /// `hits / (hits + misses)`, `0.0` when no lookups happened.
    pub hit_rate: f64,
    /// `bytes / entries`, `0.0` when empty.
    pub avg_entry_size: f64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    hits: u64,
    estimated_bytes: usize,
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Keys ordered least-recently-used first.
    order: Vec<K>,
    bytes_used: usize,
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
}

/// Generic TTL + LRU + size-bounded cache.
///
/// All operations take `&self`; interior state is behind a `Mutex` so a
/// single instance can back concurrent router and registry paths.
pub struct Cache<K, V> {
    config: CacheConfig,
    inner: Arc<Mutex<CacheInner<K, V>>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Serialize + Send + 'static,
{
    /// Create a cache with the given configuration.
    ///
    /// When `cleanup_interval_ms > 0` and a tokio runtime is present, a
    /// background sweep task is spawned. The task holds only a weak handle to
    /// the cache state, so dropping the cache (or calling
    /// [`destroy`](Cache::destroy)) ends it and it never pins the process.
    pub fn new(config: CacheConfig) -> Self {
        let inner = Arc::new(Mutex::new(CacheInner {
            entries: HashMap::new(),
            order: Vec::new(),
            bytes_used: 0,
            hits: 0,
            misses: 0,
            sets: 0,
            evictions: 0,
        }));

        let cleanup_task = if config.cleanup_interval_ms > 0 {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak = Arc::downgrade(&inner);
                    let interval = Duration::from_millis(config.cleanup_interval_ms);
                    let ttl_ms = config.ttl_ms;
                    Some(handle.spawn(async move {
                        loop {
                            tokio::time::sleep(interval).await;
                            let Some(inner) = weak.upgrade() else { break };
                            let mut guard = inner.lock().unwrap();
                            Self::sweep_expired(&mut guard, ttl_ms);
                        }
                    }))
                }
                Err(_) => None,
            }
        } else {
            None
        };

        Self {
            config,
            inner,
            cleanup_task: Mutex::new(cleanup_task),
        }
    }

    /// Look up a key.
    ///
    /// Returns the cached value only when it has not expired. A hit moves the
    /// entry to the most-recently-used position and increments its hit
    /// counter; an expired entry is removed and counted as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let ttl_ms = self.config.ttl_ms;

        let expired = match inner.entries.get(key) {
            Some(entry) => Self::is_expired(entry, ttl_ms),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            // Lazy sweep of this key; expiry removals are not evictions.
            if let Some(entry) = inner.entries.remove(key) {
                inner.bytes_used -= entry.estimated_bytes;
            }
            inner.order.retain(|k| k != key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        // LRU touch: move to the most-recent position.
        inner.order.retain(|k| k != key);
        inner.order.push(key.clone());
        let entry = inner.entries.get_mut(key).unwrap();
        entry.hits += 1;
        let value = entry.value.clone();
        if self.config.debug {
            log::debug!("cache hit");
        }
        Some(value)
    }

    /// Insert a value.
    ///
    /// Rejects (returns `false`) when the value alone exceeds the byte
    /// budget. Otherwise evicts least-recently-used entries until both the
    /// entry count and byte budget admit the new entry, then inserts it at
    /// the most-recently-used position.
    pub fn set(&self, key: K, value: V) -> bool {
        let estimated_bytes = estimate_size(&value);
        if self.config.max_bytes > 0 && estimated_bytes > self.config.max_bytes {
            if self.config.debug {
                log::debug!(
                    "cache rejecting oversized entry ({} > {} bytes)",
                    estimated_bytes,
                    self.config.max_bytes
                );
            }
            return false;
        }

        let mut inner = self.inner.lock().unwrap();

        // Replace any previous entry for this key before capacity checks.
        if let Some(old) = inner.entries.remove(&key) {
            inner.bytes_used -= old.estimated_bytes;
        }
        inner.order.retain(|k| k != &key);

        while (self.config.max_entries > 0 && inner.entries.len() >= self.config.max_entries)
            || (self.config.max_bytes > 0
                && inner.bytes_used + estimated_bytes > self.config.max_bytes)
        {
            if inner.order.is_empty() {
                break;
            }
            let victim = inner.order.remove(0);
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.bytes_used -= entry.estimated_bytes;
                inner.evictions += 1;
            }
        }

        inner.bytes_used += estimated_bytes;
        inner.order.push(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                hits: 0,
                estimated_bytes,
            },
        );
        inner.sets += 1;
        true
    }

    /// Remove a key, returning whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.order.retain(|k| k != key);
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.bytes_used -= entry.estimated_bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every entry. Counters are retained.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
        inner.bytes_used = 0;
    }

    /// Keys ordered least-recently-used first.
    ///
    /// With no expiry and no evictions this is insertion order; a
    /// [`get`](Cache::get) moves the touched key to the end.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().unwrap().order.clone()
    }

    /// Current counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let lookups = inner.hits + inner.misses;
        let entries = inner.entries.len();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            sets: inner.sets,
            evictions: inner.evictions,
            entries,
            bytes: inner.bytes_used,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            avg_entry_size: if entries == 0 {
                0.0
            } else {
                inner.bytes_used as f64 / entries as f64
            },
        }
    }

    /// Remove all expired entries now, regardless of the sweep interval.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::sweep_expired(&mut inner, self.config.ttl_ms);
    }

    /// Cancel the background sweep task.
    ///
    /// Safe to call multiple times; dropping the cache has the same effect.
    pub fn destroy(&self) {
        if let Some(task) = self.cleanup_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn is_expired(entry: &CacheEntry<V>, ttl_ms: u64) -> bool {
        ttl_ms > 0 && entry.inserted_at.elapsed() >= Duration::from_millis(ttl_ms)
    }

    fn sweep_expired(inner: &mut CacheInner<K, V>, ttl_ms: u64) {
        if ttl_ms == 0 {
            return;
        }
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, e)| Self::is_expired(e, ttl_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.bytes_used -= entry.estimated_bytes;
            }
            inner.order.retain(|k| k != &key);
        }
    }
}

impl<K, V> Drop for Cache<K, V> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.cleanup_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Estimate an entry's footprint as `2 × len(json(value))`, falling back to
/// 1 KiB for values that do not serialise.
fn estimate_size<V: Serialize>(value: &V) -> usize {
    match serde_json::to_string(value) {
        Ok(json) => 2 * json.len(),
        Err(_) => FALLBACK_ENTRY_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, ttl_ms: u64, max_bytes: usize) -> Cache<String, String> {
        Cache::new(CacheConfig {
            max_entries,
            ttl_ms,
            max_bytes,
            cleanup_interval_ms: 0,
            debug: false,
        })
    }

    #[test]
    fn lru_order_reflects_access() {
        let c = cache(10, 0, 0);
        c.set("a".into(), "1".into());
        c.set("b".into(), "2".into());
        c.set("c".into(), "3".into());
        assert_eq!(c.keys(), vec!["a", "b", "c"]);

        c.get(&"a".to_string());
        assert_eq!(c.keys(), vec!["b", "c", "a"]);
    }

    #[test]
    fn capacity_eviction_counts() {
        let c = cache(2, 0, 0);
        c.set("a".into(), "1".into());
        c.set("b".into(), "2".into());
        c.set("c".into(), "3".into());

        assert!(c.get(&"a".to_string()).is_none());
        let stats = c.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);
    }

    #[test]
    fn oversized_entries_are_rejected() {
        let c = cache(10, 0, 16);
        let big = "x".repeat(64);
        assert!(!c.set("big".into(), big));
        assert_eq!(c.stats().entries, 0);
    }

    #[test]
    fn expired_entries_miss_without_eviction_count() {
        let c = cache(10, 1, 0);
        c.set("a".into(), "1".into());
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get(&"a".to_string()).is_none());

        let stats = c.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn replacing_a_key_does_not_double_count_bytes() {
        let c = cache(10, 0, 1024);
        c.set("a".into(), "first".into());
        let before = c.stats().bytes;
        c.set("a".into(), "second value that is longer".into());
        let after = c.stats().bytes;
        assert!(after > before);
        assert_eq!(c.stats().entries, 1);
    }
}

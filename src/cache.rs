//! Read-through value cache for memory mode.
//!
//! An S3-FIFO shaped cache: new keys enter a small probationary queue, keys
//! read more than once graduate to the main queue, and keys evicted from the
//! probationary queue unread leave a ghost trace so a quick return re-enters
//! the main queue directly. Values may carry a TTL; expired values are
//! dropped lazily on access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum access frequency tracked per entry.
const MAX_FREQUENCY: u8 = 3;

#[derive(Debug)]
struct CachedValue {
    value: Vec<u8>,
    freq: u8,
    expires_at: Option<Instant>,
}

impl CachedValue {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// New keys queue here first.
    small: VecDeque<Vec<u8>>,
    /// Keys accessed at least twice.
    main: VecDeque<Vec<u8>>,
    /// Keys recently evicted from `small` without a second access.
    ghost: VecDeque<Vec<u8>>,
    ghost_set: HashSet<Vec<u8>>,
    entries: HashMap<Vec<u8>, CachedValue>,
    stats: CacheStats,
}

/// Thread-safe read-through cache keyed by the store's key bytes.
#[derive(Debug)]
pub struct ValueCache {
    capacity: usize,
    small_target: usize,
    ttl: Option<Duration>,
    inner: Mutex<CacheInner>,
}

impl ValueCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = capacity.max(8);
        Self {
            capacity,
            small_target: capacity / 10,
            ttl,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Looks a value up, bumping its frequency. Expired values are removed.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            Some(cached) => cached.expired(now),
            None => {
                inner.stats.misses += 1;
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            return None;
        }

        let cached = inner.entries.get_mut(key).expect("checked above");
        cached.freq = (cached.freq + 1).min(MAX_FREQUENCY);
        let value = cached.value.clone();
        inner.stats.hits += 1;
        Some(value)
    }

    /// Inserts or refreshes a value. Keys with a live ghost trace re-enter
    /// the main queue directly.
    pub fn insert(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);

        if let Some(cached) = inner.entries.get_mut(key) {
            cached.value = value.to_vec();
            cached.expires_at = expires_at;
            return;
        }

        if inner.ghost_set.remove(key) {
            inner.main.push_back(key.to_vec());
        } else {
            inner.small.push_back(key.to_vec());
        }
        inner.entries.insert(
            key.to_vec(),
            CachedValue {
                value: value.to_vec(),
                freq: 0,
                expires_at,
            },
        );
        self.evict(&mut inner);
    }

    pub fn remove(&self, key: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.remove(key);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.small.clear();
        inner.main.clear();
        inner.ghost.clear();
        inner.ghost_set.clear();
        inner.entries.clear();
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats
    }

    fn evict(&self, inner: &mut CacheInner) {
        while inner.entries.len() > self.capacity {
            if inner.small.len() > self.small_target {
                self.evict_small(inner);
            } else {
                self.evict_main(inner);
            }
        }
        while inner.ghost.len() > self.capacity {
            if let Some(key) = inner.ghost.pop_front() {
                inner.ghost_set.remove(&key);
            }
        }
    }

    fn evict_small(&self, inner: &mut CacheInner) {
        while let Some(key) = inner.small.pop_front() {
            let Some(cached) = inner.entries.get_mut(&key) else {
                continue; // removed or invalidated while queued
            };
            if cached.freq > 0 {
                // Read since insertion: graduate to main.
                cached.freq = 0;
                inner.main.push_back(key);
            } else {
                inner.entries.remove(&key);
                if inner.ghost_set.insert(key.clone()) {
                    inner.ghost.push_back(key);
                }
            }
            return;
        }
    }

    fn evict_main(&self, inner: &mut CacheInner) {
        while let Some(key) = inner.main.pop_front() {
            let Some(cached) = inner.entries.get_mut(&key) else {
                continue;
            };
            if cached.freq > 0 {
                // Second chance, decayed.
                cached.freq -= 1;
                inner.main.push_back(key);
            } else {
                inner.entries.remove(&key);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache = ValueCache::new(64, None);
        assert_eq!(cache.get(b"k"), None);

        cache.insert(b"k", b"v1");
        assert_eq!(cache.get(b"k"), Some(b"v1".to_vec()));

        cache.insert(b"k", b"v2");
        assert_eq!(cache.get(b"k"), Some(b"v2".to_vec()));

        cache.remove(b"k");
        assert_eq!(cache.get(b"k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = ValueCache::new(16, None);
        for i in 0..200u32 {
            cache.insert(&i.to_le_bytes(), b"value");
        }
        assert!(cache.len() <= 16);
    }

    #[test]
    fn test_hot_keys_survive_scan() {
        let cache = ValueCache::new(32, None);
        cache.insert(b"hot", b"value");
        // Two reads graduate the key out of the probationary queue.
        cache.get(b"hot");
        cache.get(b"hot");

        for i in 0..500u32 {
            cache.insert(&i.to_le_bytes(), b"noise");
        }
        assert_eq!(cache.get(b"hot"), Some(b"value".to_vec()));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ValueCache::new(16, Some(Duration::from_millis(20)));
        cache.insert(b"k", b"v");
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(b"k"), None);
        assert_eq!(cache.len(), 0);
    }
}

//! Content-addressed bytecode cache with LRU eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the raw (unwrapped) script text.
pub fn fingerprint(script_text: &str) -> String {
    let digest = Sha256::digest(script_text.as_bytes());
    hex::encode(digest)
}

struct CacheEntry {
    bytes: Vec<u8>,
    last_used: Instant,
    use_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

/// Bytecode cache, bounded to `capacity` entries with least-recently-used
/// eviction. Lock scope is kept short: callers compile outside the lock
/// and only hold it across `get`/`put`.
pub struct BytecodeCache {
    inner: Mutex<Inner>,
}

impl BytecodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                capacity: capacity.max(1),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Looks up `fingerprint`. On a hit, refreshes recency and returns a
    /// copy of the cached bytecode.
    pub fn get(&self, fingerprint: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("bytecode cache poisoned");
        if let Some(entry) = inner.entries.get_mut(fingerprint) {
            entry.last_used = Instant::now();
            entry.use_count += 1;
            let bytes = entry.bytes.clone();
            inner.hits += 1;
            return Some(bytes);
        }
        inner.misses += 1;
        None
    }

    /// Inserts `bytes` under `fingerprint`, evicting the least-recently-used
    /// entry first if the cache is already at capacity.
    pub fn put(&self, fingerprint: String, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().expect("bytecode cache poisoned");
        if !inner.entries.contains_key(&fingerprint) && inner.entries.len() >= inner.capacity {
            if let Some(victim) = inner
                .entries
                .iter()
                .min_by_key(|(key, entry)| (entry.last_used, (*key).clone()))
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                bytes,
                last_used: Instant::now(),
                use_count: 1,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("bytecode cache poisoned");
        inner.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("bytecode cache poisoned");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_increments_use_count_and_refreshes_recency() {
        let cache = BytecodeCache::new(10);
        cache.put("a".to_string(), vec![1, 2, 3]);
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn miss_is_counted() {
        let cache = BytecodeCache::new(10);
        assert_eq!(cache.get("missing"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let cache = BytecodeCache::new(3);
        for i in 0..10 {
            cache.put(format!("fp{i}"), vec![i as u8]);
        }
        assert!(cache.stats().size <= 3);
    }

    #[test]
    fn lru_eviction_removes_the_least_recently_used_entry() {
        let cache = BytecodeCache::new(2);
        cache.put("a".to_string(), vec![1]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.put("b".to_string(), vec![2]);
        // touch "a" so "b" becomes the least-recently-used
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get("a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.put("c".to_string(), vec![3]);

        assert_eq!(cache.get("b"), None, "b should have been evicted");
        assert_eq!(cache.get("a"), Some(vec![1]));
        assert_eq!(cache.get("c"), Some(vec![3]));
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = BytecodeCache::new(5);
        cache.put("a".to_string(), vec![1]);
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}

//! Bounded working-set caches
//!
//! All caches are sharded LRU maps so concurrent readers rarely contend
//! on the same lock. The tag-filter→TSIDs cache is versioned through a
//! global generation counter: bumping the counter makes every older
//! entry unreachable without touching the cache itself.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_64;

/// Useless-filter cache key prefix for a single tag filter
pub(crate) const USELESS_SINGLE_TAG_FILTER_KEY_PREFIX: u8 = 0;

/// Useless-filter cache key prefix for a whole filter set
pub(crate) const USELESS_MULTI_TAG_FILTERS_KEY_PREFIX: u8 = 1;

/// Useless-filter cache key prefix for negative-only filter sets
pub(crate) const USELESS_NEGATIVE_TAG_FILTER_KEY_PREFIX: u8 = 2;

/// Value stored for useless-filter entries; only presence matters
pub(crate) const USELESS_TAG_FILTER_CACHE_VALUE: &[u8] = b"1";

/// Generation counter for versioned tag-cache keys
static TAG_FILTERS_KEY_GEN: AtomicU64 = AtomicU64::new(0);

/// Make all versioned tag-cache entries unreachable.
///
/// Called from the store's flush callback on every insert and
/// explicitly on delete, so it must stay cheap.
pub fn invalidate_tag_cache() {
    TAG_FILTERS_KEY_GEN.fetch_add(1, Ordering::Relaxed);
}

/// Current tag-cache generation
pub fn tag_filters_key_gen() -> u64 {
    TAG_FILTERS_KEY_GEN.load(Ordering::Relaxed)
}

const SHARD_COUNT: usize = 16;

/// Sharded bounded LRU cache over byte keys and values
pub struct WorkingSetCache {
    shards: Vec<Mutex<LruCache<Vec<u8>, Vec<u8>>>>,
    requests: AtomicU64,
    misses: AtomicU64,
}

impl WorkingSetCache {
    /// Create a cache bounded to roughly `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let per_shard = NonZeroUsize::new((capacity / SHARD_COUNT).max(1)).unwrap();
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            shards,
            requests: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<LruCache<Vec<u8>, Vec<u8>>> {
        let idx = (xxh3_64(key) as usize) % SHARD_COUNT;
        &self.shards[idx]
    }

    /// Look up `key`, refreshing its recency on hit
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let hit = self.shard(key).lock().get(key).cloned();
        if hit.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Insert or replace an entry
    pub fn set(&self, key: &[u8], value: &[u8]) {
        self.shard(key).lock().put(key.to_vec(), value.to_vec());
    }

    /// Current number of entries
    pub fn entry_count(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().len() as u64).sum()
    }

    /// Approximate memory held by keys and values
    pub fn size_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .iter()
                    .map(|(k, v)| (k.len() + v.len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    /// Total lookups served
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set() {
        let cache = WorkingSetCache::new(64);
        assert!(cache.get(b"k").is_none());
        cache.set(b"k", b"v");
        assert_eq!(cache.get(b"k").as_deref(), Some(&b"v"[..]));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_eviction_is_bounded() {
        let cache = WorkingSetCache::new(SHARD_COUNT);
        for i in 0..10_000u32 {
            cache.set(&i.to_be_bytes(), b"v");
        }
        // One entry per shard at most.
        assert!(cache.entry_count() <= SHARD_COUNT as u64);
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = WorkingSetCache::new(64);
        cache.set(b"k", b"v");
        cache.get(b"k");
        cache.get(b"absent");
        assert_eq!(cache.requests(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_generation_counter_monotonic() {
        let before = tag_filters_key_gen();
        invalidate_tag_cache();
        invalidate_tag_cache();
        assert!(tag_filters_key_gen() >= before + 2);
    }
}

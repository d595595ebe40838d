// Copyright (C) 2024, the strata authors. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Clean node cache shared across successive disk layers.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;

/// An LRU cache of clean (already persisted) trie node blobs, keyed by
/// the owner-qualified node path.
///
/// The cache outlives any single disk layer; ownership is handed from a
/// stale layer to its successor so warm entries survive commits.
pub struct CleanCache {
    inner: Mutex<LruCache<Vec<u8>, Bytes>>,
}

impl std::fmt::Debug for CleanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanCache")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

impl CleanCache {
    /// Creates a cache bounded to `entries` nodes.
    #[must_use]
    pub fn new(entries: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(entries)),
        }
    }

    /// Looks up a node blob, promoting it on hit.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let cached = self.inner.lock().get(key).cloned();
        counter!("strata.cache.clean", "type" => if cached.is_some() { "hit" } else { "miss" })
            .increment(1);
        cached
    }

    /// Inserts or refreshes a node blob.
    pub fn set(&self, key: Vec<u8>, blob: Bytes) {
        self.inner.lock().put(key, blob);
    }

    /// Drops a node blob, if cached.
    pub fn remove(&self, key: &[u8]) {
        self.inner.lock().pop(key);
    }

    /// Drops every cached entry.
    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Returns the number of cached nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[test]
    fn test_hit_miss_and_eviction() {
        let cache = CleanCache::new(NonZeroUsize::new(2).unwrap());
        cache.set(b"a".to_vec(), Bytes::from_static(b"1"));
        cache.set(b"b".to_vec(), Bytes::from_static(b"2"));

        assert_eq!(cache.get(b"a"), Some(Bytes::from_static(b"1")));

        // "b" is now the least recently used entry and gets evicted
        cache.set(b"c".to_vec(), Bytes::from_static(b"3"));
        assert_eq!(cache.get(b"b"), None);
        assert_eq!(cache.get(b"a"), Some(Bytes::from_static(b"1")));

        cache.remove(b"a");
        assert_eq!(cache.get(b"a"), None);

        cache.reset();
        assert!(cache.is_empty());
    }
}

//! Compiled-script LRU cache
//!
//! Many readers, single writer: the hot path peeks under a read lock;
//! inserts and evictions take the write lock. Recency is updated on the
//! insert path only, which keeps lookups contention-free.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use std::sync::RwLock;

use crate::CompiledScript;

/// Process-wide cache of compiled scripts keyed by wrapped source
pub struct ScriptCache {
    entries: RwLock<LruCache<String, Arc<CompiledScript>>>,
}

impl ScriptCache {
    /// Create a cache with the given capacity (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Look up a compiled script without taking the write lock
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<Arc<CompiledScript>> {
        self.entries
            .read()
            .ok()
            .and_then(|cache| cache.peek(key).cloned())
    }

    /// Insert a freshly compiled script, returning the cached handle.
    ///
    /// When a concurrent compile raced us to the same key, the existing entry
    /// wins so every caller holds the same artifact.
    pub fn insert(&self, key: String, compiled: CompiledScript) -> Arc<CompiledScript> {
        let Ok(mut cache) = self.entries.write() else {
            return Arc::new(compiled);
        };
        if let Some(existing) = cache.get(&key) {
            return Arc::clone(existing);
        }
        let handle = Arc::new(compiled);
        cache.put(key, Arc::clone(&handle));
        handle
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

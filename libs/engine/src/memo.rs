//! Memoization cache
//!
//! Per-process LRU mapping `(step fingerprint, input fingerprint)` to
//! outputs. Only successful outputs are cached; failures never populate or
//! overwrite entries. No TTL: eviction is LRU-only.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use argyll_domain::{args_fingerprint, step_fingerprint, Args, Step};

/// Cache of memoized step outputs
pub struct MemoCache {
    entries: Mutex<LruCache<String, Args>>,
}

impl MemoCache {
    /// Create a cache with the given capacity (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(step: &Step, inputs: &Args) -> String {
        format!("{}:{}", step_fingerprint(step), args_fingerprint(inputs))
    }

    /// Cached outputs for the step and inputs, when present
    #[must_use]
    pub fn lookup(&self, step: &Step, inputs: &Args) -> Option<Args> {
        let key = Self::key(step, inputs);
        self.entries.lock().ok()?.get(&key).cloned()
    }

    /// Record successful outputs
    pub fn store(&self, step: &Step, inputs: &Args, outputs: &Args) {
        let key = Self::key(step, inputs);
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(key, outputs.clone());
        }
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

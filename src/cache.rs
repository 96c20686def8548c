//! Bounded, thread-safe result cache
//!
//! A single mutex guards the LRU map. Lookups and inserts hold it briefly;
//! computing a missing value happens outside the lock, and the insert keeps
//! whichever value landed first so concurrent callers share one result.

use crate::error::ComputeError;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 64;

/// Identity of one cached analysis
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub region_id: String,
    pub lookback_days: usize,
    pub horizon_days: usize,
}

impl CacheKey {
    pub fn new(region_id: impl Into<String>, lookback_days: usize, horizon_days: usize) -> Self {
        Self {
            region_id: region_id.into(),
            lookback_days,
            horizon_days,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}d:{}d", self.region_id, self.lookback_days, self.horizon_days)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub len: usize,
    pub capacity: usize,
}

/// LRU cache of shared results
pub struct ResultCache<V> {
    entries: Mutex<LruCache<CacheKey, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> ResultCache<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache with a plain capacity; zero is rejected
    pub fn with_capacity(capacity: usize) -> Result<Self, ComputeError> {
        NonZeroUsize::new(capacity)
            .map(Self::new)
            .ok_or_else(|| ComputeError::InvalidConfig("cache capacity must be positive".into()))
    }

    // A panic while holding the lock cannot leave the map half-updated,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Arc<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up and mark as most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        let found = self.lock().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "cache miss");
        }
        found
    }

    /// Insert unless another caller already stored a value for `key`;
    /// returns the value that ends up cached
    pub fn insert_if_absent(&self, key: CacheKey, value: Arc<V>) -> Arc<V> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            return Arc::clone(existing);
        }
        if let Some((evicted, _)) = entries.push(key, Arc::clone(&value)) {
            debug!(key = %evicted, "cache eviction");
        }
        value
    }

    /// Return the cached value or compute, cache and return it.
    ///
    /// `compute` runs without the lock held; errors are returned uncached.
    pub fn get_or_try_insert<E, F>(&self, key: CacheKey, compute: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let value = Arc::new(compute()?);
        Ok(self.insert_if_absent(key, value))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            len: entries.len(),
            capacity: entries.cap().get(),
        }
    }
}

impl<V> fmt::Debug for ResultCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache").field("stats", &self.stats()).finish()
    }
}

//! Byte-bounded LRU cache of immutable asset buffers.
//!
//! Entries are `Arc<[u8]>`; a caller holding a clone keeps the entry pinned
//! (it is skipped by eviction). The recency list sits behind one mutex and
//! loaders always run outside it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors returned by [`AssetCache`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The asset alone exceeds the cache capacity.
    #[error("asset {key} is {size} bytes, larger than the {capacity} byte cache")]
    TooLarge {
        /// Asset key.
        key: String,
        /// Asset size.
        size: u64,
        /// Cache capacity.
        capacity: u64,
    },
    /// The loader failed.
    #[error("loading asset {key} failed: {message}")]
    Load {
        /// Asset key.
        key: String,
        /// Loader error text.
        message: String,
    },
}

/// Counters exposed by [`AssetCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that ran the loader.
    pub misses: u64,
    /// Entries evicted to make room.
    pub evictions: u64,
    /// Loads returned uncached because borrowed entries left no room.
    pub bypasses: u64,
    /// Bytes currently resident.
    pub resident_bytes: u64,
    /// Entries currently resident.
    pub entries: usize,
}

impl CacheStats {
    /// Share of lookups served from the cache, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: LruCache<String, Arc<[u8]>>,
    resident: u64,
    stats: CacheStats,
}

/// Bounded in-memory asset cache.
pub struct AssetCache {
    capacity: u64,
    inner: Mutex<Inner>,
}

impl fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

fn byte_len(data: &[u8]) -> u64 {
    u64::try_from(data.len()).unwrap_or(u64::MAX)
}

impl AssetCache {
    /// Create a cache holding at most `capacity_bytes`.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        tracing::info!(capacity_bytes, "asset cache created");
        Self {
            capacity: capacity_bytes,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                resident: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Fixed capacity in bytes.
    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    /// Return the cached asset or load, admit, and return it.
    pub fn get_or_load<F, E>(&self, key: &str, loader: F) -> Result<Arc<[u8]>, CacheError>
    where
        F: FnOnce() -> Result<Vec<u8>, E>,
        E: fmt::Display,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        let data = loader().map_err(|e| CacheError::Load {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.admit(key, data)
    }

    /// Async variant of [`AssetCache::get_or_load`].
    pub async fn get_or_load_async<F, Fut, E>(&self, key: &str, loader: F) -> Result<Arc<[u8]>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, E>>,
        E: fmt::Display,
    {
        if let Some(hit) = self.lookup(key) {
            return Ok(hit);
        }
        let data = loader().await.map_err(|e| CacheError::Load {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.admit(key, data)
    }

    /// Drop an entry. Outstanding borrows stay valid.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.pop(key) {
            Some(data) => {
                inner.resident -= byte_len(&data);
                tracing::debug!(key, "asset invalidated");
                true
            }
            None => false,
        }
    }

    /// Whether `key` is resident. Does not touch recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            resident_bytes: inner.resident,
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        if let Some(data) = inner.entries.get(key).cloned() {
            inner.stats.hits += 1;
            tracing::debug!(key, "asset cache hit");
            return Some(data);
        }
        inner.stats.misses += 1;
        tracing::debug!(key, "asset cache miss");
        None
    }

    fn admit(&self, key: &str, data: Vec<u8>) -> Result<Arc<[u8]>, CacheError> {
        let size = byte_len(&data);
        if size > self.capacity {
            return Err(CacheError::TooLarge {
                key: key.to_string(),
                size,
                capacity: self.capacity,
            });
        }
        let data: Arc<[u8]> = Arc::from(data);

        let mut inner = self.inner.lock();
        // Another caller may have loaded the same key while we were outside the lock.
        if let Some(existing) = inner.entries.get(key) {
            return Ok(Arc::clone(existing));
        }
        if inner.resident + size > self.capacity {
            let evictable: u64 = inner
                .entries
                .iter()
                .filter(|(_, v)| Arc::strong_count(v) == 1)
                .map(|(_, v)| byte_len(v))
                .sum();
            // Decide before evicting: a load that cannot fit leaves the cache untouched.
            if inner.resident - evictable + size > self.capacity {
                inner.stats.bypasses += 1;
                tracing::debug!(key, size, evictable, "borrowed assets leave no room; returning uncached");
                return Ok(data);
            }
        }
        while inner.resident + size > self.capacity {
            let victim = inner
                .entries
                .iter()
                .rev()
                .find(|(_, v)| Arc::strong_count(v) == 1)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                inner.stats.bypasses += 1;
                tracing::debug!(key, size, "every resident asset is borrowed; returning uncached");
                return Ok(data);
            };
            if let Some(evicted) = inner.entries.pop(&victim) {
                inner.resident -= byte_len(&evicted);
                inner.stats.evictions += 1;
                tracing::debug!(key = %victim, "asset evicted");
            }
        }
        inner.resident += size;
        inner.entries.put(key.to_string(), Arc::clone(&data));
        Ok(data)
    }
}

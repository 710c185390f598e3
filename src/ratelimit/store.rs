//! Cached access to the durable counter store.
//!
//! [`CounterStore`] is a read-through/write-through cache in front of a
//! [`CounterBackend`]. The cache is never authoritative on its own: a miss
//! falls through to the backend, and every write goes to both. The cache is
//! bounded; when full, the least recently used entry among a sample is
//! evicted.
//!
//! The store also owns the sharded per-key locks the governor holds across
//! its read-increment-write sequence.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::backend::CounterBackend;
use super::counter::{CounterKey, CounterRecord};
use crate::error::StoreError;

/// Entries inspected when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 32;

/// Tuning for a [`CounterStore`].
#[derive(Debug, Clone)]
pub struct CounterStoreConfig {
    /// Maximum cached records; zero disables the cache.
    pub cache_capacity: usize,
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
    /// Number of lock shards for per-key admission.
    pub lock_shards: usize,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            backend_timeout: Duration::from_millis(250),
            lock_shards: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: CounterRecord,
    last_access: Instant,
}

/// Fixed set of async mutexes selected by key hash.
#[derive(Debug)]
struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn shard_for(&self, key: &CounterKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }
}

/// Read-through/write-through counter cache over a durable backend.
pub struct CounterStore {
    backend: Arc<dyn CounterBackend>,
    cache: DashMap<CounterKey, CachedRecord>,
    locks: KeyLocks,
    capacity: usize,
    timeout: Duration,
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("cached", &self.cache.len())
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CounterStore {
    /// Create a store over `backend`.
    pub fn new(backend: Arc<dyn CounterBackend>, config: CounterStoreConfig) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            locks: KeyLocks::new(config.lock_shards),
            capacity: config.cache_capacity,
            timeout: config.backend_timeout,
        }
    }

    /// Acquire the admission lock for `key`.
    ///
    /// Hold the guard across get → increment → upsert so concurrent
    /// admissions on the same key are serialized.
    pub async fn lock(&self, key: &CounterKey) -> MutexGuard<'_, ()> {
        self.locks.shard_for(key).lock().await
    }

    /// Look up a record, consulting the cache before the backend.
    pub async fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        let hit = self.cache.get_mut(key).map(|mut cached| {
            cached.last_access = Instant::now();
            cached.record.clone()
        });
        if let Some(record) = hit {
            trace!(key = %key, "Counter cache hit");
            return Ok(Some(record));
        }

        let fetched = self.bounded(self.backend.get(key)).await?;
        if let Some(ref record) = fetched {
            self.cache_insert(record.clone());
        }
        Ok(fetched)
    }

    /// Persist a record.
    ///
    /// The cache is refreshed first. A backend failure is logged and
    /// swallowed; the cached value stays valid for this process.
    pub async fn upsert(&self, record: &CounterRecord) {
        self.cache_insert(record.clone());

        if let Err(e) = self.bounded(self.backend.upsert(record)).await {
            warn!(
                identifier = %record.identifier,
                endpoint = %record.endpoint,
                window_start = record.window_start,
                error = %e,
                "Failed to persist counter record"
            );
        }
    }

    /// Sum of durable counts for `(identifier, endpoint)` since `cutoff`.
    pub async fn sum_since(
        &self,
        identifier: &str,
        endpoint: &str,
        cutoff: u64,
    ) -> Result<u64, StoreError> {
        self.bounded(self.backend.sum_since(identifier, endpoint, cutoff))
            .await
    }

    /// Retention sweep: drop records older than `cutoff` from both layers.
    pub async fn sweep_before(&self, cutoff: u64) -> Result<usize, StoreError> {
        self.cache.retain(|key, _| key.window_start >= cutoff);
        let removed = self.bounded(self.backend.delete_before(cutoff)).await?;
        debug!(cutoff = cutoff, removed = removed, "Swept expired counter records");
        Ok(removed)
    }

    /// Number of cached records.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Cached copy of a record, without touching the backend.
    pub fn cached(&self, key: &CounterKey) -> Option<CounterRecord> {
        self.cache.get(key).map(|c| c.record.clone())
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn cache_insert(&self, record: CounterRecord) {
        if self.capacity == 0 {
            return;
        }

        let key = record.key();
        if !self.cache.contains_key(&key) {
            while self.cache.len() >= self.capacity {
                if !self.evict_one() {
                    break;
                }
            }
        }

        self.cache.insert(
            key,
            CachedRecord {
                record,
                last_access: Instant::now(),
            },
        );
    }

    /// Evict the least recently used entry among a sample.
    fn evict_one(&self) -> bool {
        // Collect the victim before removing; removing while iterating
        // would deadlock on the shard lock.
        let victim = self
            .cache
            .iter()
            .take(EVICTION_SAMPLE)
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                trace!(key = %key, "Evicting cached counter record");
                self.cache.remove(&key).is_some()
            }
            None => false,
        }
    }
}

//! Durable counter store port and the bundled in-memory backend.

use async_trait::async_trait;
use dashmap::DashMap;

use super::counter::{CounterKey, CounterRecord};
use crate::error::StoreError;

/// Durable storage for counter records.
///
/// Implementations may live behind any I/O boundary; the governor bounds
/// every call with a timeout and never lets a failure reach its callers.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Fetch one record by its `(identifier, endpoint, window_start)` key.
    async fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError>;

    /// Insert or replace the record stored under `record.key()`.
    async fn upsert(&self, record: &CounterRecord) -> Result<(), StoreError>;

    /// Sum `requests_count` over every record for `(identifier, endpoint)`
    /// whose `window_start >= cutoff`.
    async fn sum_since(
        &self,
        identifier: &str,
        endpoint: &str,
        cutoff: u64,
    ) -> Result<u64, StoreError>;

    /// Delete records whose `window_start < cutoff`, returning how many went.
    async fn delete_before(&self, cutoff: u64) -> Result<usize, StoreError>;
}

/// Process-local backend backed by a sharded concurrent map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: DashMap<CounterKey, CounterRecord>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the backend holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    async fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn upsert(&self, record: &CounterRecord) -> Result<(), StoreError> {
        self.records.insert(record.key(), record.clone());
        Ok(())
    }

    async fn sum_since(
        &self,
        identifier: &str,
        endpoint: &str,
        cutoff: u64,
    ) -> Result<u64, StoreError> {
        let total = self
            .records
            .iter()
            .filter(|r| {
                r.identifier == identifier && r.endpoint == endpoint && r.window_start >= cutoff
            })
            .map(|r| r.requests_count)
            .sum();
        Ok(total)
    }

    async fn delete_before(&self, cutoff: u64) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|key, _| key.window_start >= cutoff);
        Ok(before.saturating_sub(self.records.len()))
    }
}

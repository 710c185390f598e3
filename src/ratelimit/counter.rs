//! Request counter records.

use serde::{Deserialize, Serialize};

/// Key identifying one counting window for one identifier on one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    /// The principal being limited (`user:42`, `ip:1.2.3.4`).
    pub identifier: String,
    /// Normalized endpoint key (`GET /api/items/:id`).
    pub endpoint: String,
    /// Window start, epoch milliseconds.
    pub window_start: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(identifier: &str, endpoint: &str, window_start: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            window_start,
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.identifier, self.endpoint, self.window_start)
    }
}

/// Number of requests seen in one window.
///
/// At most one live record exists per key, and `requests_count` only grows
/// during the record's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub identifier: String,
    pub endpoint: String,
    pub window_start: u64,
    pub requests_count: u64,
}

impl CounterRecord {
    /// Create an empty record for the window identified by `key`.
    pub fn new(key: &CounterKey) -> Self {
        Self {
            identifier: key.identifier.clone(),
            endpoint: key.endpoint.clone(),
            window_start: key.window_start,
            requests_count: 0,
        }
    }

    /// The key this record is stored under.
    pub fn key(&self) -> CounterKey {
        CounterKey::new(&self.identifier, &self.endpoint, self.window_start)
    }

    /// Count one more request and return the new total.
    pub fn increment(&mut self) -> u64 {
        self.requests_count = self.requests_count.saturating_add(1);
        self.requests_count
    }
}

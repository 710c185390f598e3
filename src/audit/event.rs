//! Violation event types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    /// A request exceeded its (possibly penalized) window quota
    RateLimitExceeded,
    /// A request exceeded the burst allowance
    BurstLimitExceeded,
    /// A blacklisted identifier attempted a request
    Blacklisted,
    /// An identifier was added to the dynamic blacklist
    BlacklistAdded,
    /// The governor failed internally and admitted the request
    GovernorError,
}

/// Severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single notification sent to the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub id: Uuid,
    pub action: ViolationAction,
    pub severity: Severity,
    pub identifier: String,
    pub endpoint: String,
    /// Free-form structured context (counts, limits, error text)
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ViolationEvent {
    /// Create an event stamped at `timestamp_ms` (epoch milliseconds).
    pub fn new(
        action: ViolationAction,
        severity: Severity,
        identifier: &str,
        endpoint: &str,
        timestamp_ms: u64,
    ) -> Self {
        let timestamp = i64::try_from(timestamp_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        Self {
            id: Uuid::new_v4(),
            action,
            severity,
            identifier: identifier.to_string(),
            endpoint: endpoint.to_string(),
            details: serde_json::Value::Null,
            timestamp,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

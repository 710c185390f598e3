//! The admission decision returned for every request.

use serde::{Deserialize, Serialize};

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    QuotaExceeded,
    BurstExceeded,
    Blacklisted,
}

/// Result of one admission check. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub remaining_requests: u64,
    pub reset_time: u64,
    pub total_requests: u64,
    pub window_start: u64,
    /// Quota in force for this request (after penalties)
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
}

impl Decision {
    /// Admit with the full quota remaining and nothing counted. Used for
    /// whitelisted identifiers and for fail-open.
    pub fn full_quota(max_requests: u64, window_start: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining_requests: max_requests,
            reset_time,
            total_requests: 0,
            window_start,
            limit: max_requests,
            reason: None,
        }
    }

    /// Deny without touching any counter.
    pub fn denied(
        reason: DenyReason,
        limit: u64,
        total_requests: u64,
        window_start: u64,
        reset_time: u64,
    ) -> Self {
        Self {
            allowed: false,
            remaining_requests: 0,
            reset_time,
            total_requests,
            window_start,
            limit,
            reason: Some(reason),
        }
    }

    /// Milliseconds from `now_ms` until the reset, zero if already past.
    pub fn retry_after_ms(&self, now_ms: u64) -> u64 {
        self.reset_time.saturating_sub(now_ms)
    }
}

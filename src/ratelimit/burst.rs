//! Short-horizon burst cap layered over the main window.
//!
//! Burst traffic is counted in its own records, separate from the main
//! window's, under the endpoint key with [`BURST_SUFFIX`] appended. Each
//! record covers one slice of `burst_window_ms / BURST_SLICES`, so the sum
//! over the trailing burst interval is exact to within one slice no matter
//! where `now` falls in the main window.

use std::sync::Arc;

use tracing::{trace, warn};

use super::counter::{CounterKey, CounterRecord};
use super::rules::BurstAllowance;
use super::store::CounterStore;
use super::window;

/// Slices per burst interval.
pub const BURST_SLICES: u64 = 10;

/// Appended to the endpoint key of burst records.
pub const BURST_SUFFIX: &str = "#burst";

/// Outcome of a burst check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstCheck {
    pub allowed: bool,
    pub requests_in_burst: u64,
}

/// Counts requests per burst slice and enforces `max_burst`.
#[derive(Debug)]
pub struct BurstGuard {
    store: Arc<CounterStore>,
}

impl BurstGuard {
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self { store }
    }

    /// Check whether `identifier` may send another request to `endpoint`.
    ///
    /// Runs before any counter is incremented, so a burst rejection is never
    /// itself counted. A failed read fails open for this gate only.
    pub async fn check_burst(
        &self,
        identifier: &str,
        endpoint: &str,
        burst: &BurstAllowance,
        now_ms: u64,
    ) -> BurstCheck {
        let burst_window_start = now_ms.saturating_sub(burst.burst_window_ms);
        let burst_endpoint = burst_endpoint(endpoint);

        match self
            .store
            .sum_since(identifier, &burst_endpoint, burst_window_start)
            .await
        {
            Ok(requests_in_burst) => {
                trace!(
                    identifier = %identifier,
                    endpoint = %endpoint,
                    requests_in_burst = requests_in_burst,
                    max_burst = burst.max_burst,
                    "Checked burst allowance"
                );
                BurstCheck {
                    allowed: requests_in_burst < burst.max_burst,
                    requests_in_burst,
                }
            }
            Err(e) => {
                warn!(
                    identifier = %identifier,
                    endpoint = %endpoint,
                    error = %e,
                    "Burst check unavailable, allowing request"
                );
                BurstCheck {
                    allowed: true,
                    requests_in_burst: 0,
                }
            }
        }
    }

    /// Count one admitted request in the current burst slice.
    ///
    /// Best effort: a failed read skips the increment with a warning.
    pub async fn record(
        &self,
        identifier: &str,
        endpoint: &str,
        burst: &BurstAllowance,
        now_ms: u64,
    ) {
        let key = burst_key(identifier, endpoint, burst, now_ms);
        let mut record = match self.store.get(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => CounterRecord::new(&key),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read burst counter");
                return;
            }
        };
        record.increment();
        self.store.upsert(&record).await;
    }
}

/// Endpoint key under which burst slices for `endpoint` are stored.
pub fn burst_endpoint(endpoint: &str) -> String {
    format!("{}{}", endpoint, BURST_SUFFIX)
}

/// Key of the burst slice containing `now_ms`.
pub fn burst_key(
    identifier: &str,
    endpoint: &str,
    burst: &BurstAllowance,
    now_ms: u64,
) -> CounterKey {
    let slice_ms = (burst.burst_window_ms / BURST_SLICES).max(1);
    CounterKey::new(
        identifier,
        &burst_endpoint(endpoint),
        window::bucket_start(now_ms, slice_ms),
    )
}

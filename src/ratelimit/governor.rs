//! The admission governor.
//!
//! One `Governor` per process owns the counter store, penalty tracker and
//! blacklist, and evaluates each request through these states:
//!
//! ```text
//! WHITELIST_CHECK → BLACKLIST_CHECK → WINDOW_RESOLVE → BURST_CHECK?
//!     → QUOTA_CHECK → PERSIST → DECISION
//! ```
//!
//! `admit` never fails. Store errors, timeouts and panics anywhere in the
//! decision path resolve to an allowed decision with the full quota
//! remaining, plus a high-severity violation event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tracing::{debug, error, trace};

use super::backend::{CounterBackend, MemoryBackend};
use super::blacklist::{BlacklistAction, BlacklistGuard, BLACKLIST_WINDOWS};
use super::burst::BurstGuard;
use super::clock::{Clock, SystemClock};
use super::counter::{CounterKey, CounterRecord};
use super::decision::{Decision, DenyReason};
use super::penalty::PenaltyTracker;
use super::rules::{LimitReached, RateLimitOptions, RateRule};
use super::store::{CounterStore, CounterStoreConfig};
use super::window::{self, WindowMode};
use crate::audit::{Severity, TracingSink, ViolationAction, ViolationEvent, ViolationLogger, ViolationSink};
use crate::config::GovernorConfig;
use crate::error::StoreError;

/// Longest error text carried in a fail-open event.
const MAX_ERROR_DETAIL: usize = 256;

/// Process-wide admission state and decision logic.
pub struct Governor {
    store: Arc<CounterStore>,
    burst: BurstGuard,
    penalties: PenaltyTracker,
    blacklist: BlacklistGuard,
    logger: ViolationLogger,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("store", &self.store)
            .field("penalized", &self.penalties.tracked())
            .field("blacklisted", &self.blacklist.len())
            .finish()
    }
}

impl Governor {
    /// Create a governor over the given collaborators.
    pub fn new(
        backend: Arc<dyn CounterBackend>,
        sink: Arc<dyn ViolationSink>,
        clock: Arc<dyn Clock>,
        config: &GovernorConfig,
    ) -> Self {
        let store = Arc::new(CounterStore::new(
            backend,
            CounterStoreConfig {
                cache_capacity: config.cache_capacity,
                backend_timeout: Duration::from_millis(config.store_timeout_ms),
                lock_shards: config.lock_shards,
            },
        ));

        Self {
            burst: BurstGuard::new(Arc::clone(&store)),
            store,
            penalties: PenaltyTracker::new(),
            blacklist: BlacklistGuard::new(),
            logger: ViolationLogger::new(sink, Duration::from_millis(config.sink_timeout_ms)),
            clock,
        }
    }

    /// Governor with an in-memory store, tracing sink and system clock.
    pub fn in_memory(config: &GovernorConfig) -> Self {
        Self::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(TracingSink),
            Arc::new(SystemClock::new()),
            config,
        )
    }

    /// Decide whether `identifier` may call `endpoint` under `rule`.
    pub async fn admit(
        &self,
        identifier: &str,
        endpoint: &str,
        rule: &RateRule,
        options: &RateLimitOptions,
    ) -> Decision {
        let now = self.clock.now_ms();

        let outcome = AssertUnwindSafe(self.evaluate(identifier, endpoint, rule, options, now))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                self.fail_open(identifier, endpoint, rule, options, now, &e.to_string())
                    .await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.fail_open(identifier, endpoint, rule, options, now, &message)
                    .await
            }
        }
    }

    async fn evaluate(
        &self,
        identifier: &str,
        endpoint: &str,
        rule: &RateRule,
        options: &RateLimitOptions,
        now: u64,
    ) -> Result<Decision, StoreError> {
        let mode = options.window_mode();
        let window_start = window::window_start(now, rule.window_ms, mode);
        let bucket = window::bucket_start(now, rule.window_ms);
        let reset_time = bucket.saturating_add(rule.window_ms);

        trace!(
            identifier = %identifier,
            endpoint = %endpoint,
            window_start = window_start,
            "Checking rate limit"
        );

        if options.whitelist.contains(identifier) {
            trace!(identifier = %identifier, "Whitelisted, skipping rate limit");
            return Ok(Decision::full_quota(rule.max_requests, window_start, reset_time));
        }

        if self
            .blacklist
            .is_blacklisted(identifier, &options.blacklist, now)
        {
            let blacklist_reset = now.saturating_add(BLACKLIST_WINDOWS.saturating_mul(rule.window_ms));
            self.report(
                ViolationAction::Blacklisted,
                Severity::Medium,
                identifier,
                endpoint,
                now,
                json!({ "reason": "blacklisted", "resetTime": blacklist_reset }),
            );
            return Ok(Decision::denied(
                DenyReason::Blacklisted,
                rule.max_requests,
                0,
                window_start,
                blacklist_reset,
            ));
        }

        let key = CounterKey::new(identifier, endpoint, bucket);
        let guard = self.store.lock(&key).await;

        let mut record = match self.store.get(&key).await? {
            Some(record) => record,
            None => {
                debug!(key = %key, "Creating new counter record");
                CounterRecord::new(&key)
            }
        };
        let previous = match mode {
            WindowMode::Sliding if bucket >= rule.window_ms => {
                let previous_key = CounterKey::new(identifier, endpoint, bucket - rule.window_ms);
                self.store
                    .get(&previous_key)
                    .await?
                    .map(|r| r.requests_count)
                    .unwrap_or(0)
            }
            _ => 0,
        };
        let observed = |count: u64| match mode {
            WindowMode::Fixed => count,
            WindowMode::Sliding => window::rolling_count(previous, count, now, rule.window_ms),
        };

        let limit = self.penalties.effective_quota(
            identifier,
            rule.max_requests,
            &options.progressive_penalty,
            now,
        );

        if let Some(burst) = &options.burst_allowance {
            let check = self.burst.check_burst(identifier, endpoint, burst, now).await;
            if !check.allowed {
                drop(guard);
                self.report(
                    ViolationAction::BurstLimitExceeded,
                    Severity::Medium,
                    identifier,
                    endpoint,
                    now,
                    json!({
                        "requestsInBurst": check.requests_in_burst,
                        "maxBurst": burst.max_burst,
                        "burstWindowMs": burst.burst_window_ms,
                    }),
                );
                return Ok(Decision::denied(
                    DenyReason::BurstExceeded,
                    limit,
                    observed(record.requests_count),
                    window_start,
                    now.saturating_add(burst.burst_window_ms),
                ));
            }
        }

        // Rejected requests count too, so retries cannot reset the window.
        record.increment();
        let total = observed(record.requests_count);
        let allowed = total <= limit;

        self.store.upsert(&record).await;
        if let Some(burst) = &options.burst_allowance {
            self.burst.record(identifier, endpoint, burst, now).await;
        }
        drop(guard);

        if !allowed {
            self.record_violation(identifier, endpoint, rule, options, total, limit, reset_time, now)
                .await;
        }

        Ok(Decision {
            allowed,
            remaining_requests: limit.saturating_sub(total),
            reset_time,
            total_requests: total,
            window_start,
            limit,
            reason: (!allowed).then_some(DenyReason::QuotaExceeded),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_violation(
        &self,
        identifier: &str,
        endpoint: &str,
        rule: &RateRule,
        options: &RateLimitOptions,
        total: u64,
        limit: u64,
        reset_time: u64,
        now: u64,
    ) {
        debug!(
            identifier = %identifier,
            endpoint = %endpoint,
            count = total,
            limit = limit,
            "Rate limit exceeded"
        );

        let policy = &options.progressive_penalty;
        if policy.enabled {
            self.penalties.record_violation(identifier, policy, now);
        }

        if let BlacklistAction::Added(entry) = self.blacklist.evaluate(identifier, rule.window_ms, now) {
            self.report(
                ViolationAction::BlacklistAdded,
                Severity::High,
                identifier,
                endpoint,
                now,
                json!({
                    "expiresAt": entry.expires_at,
                    "violationsLastHour": self.blacklist.violations_last_hour(identifier, now),
                }),
            );
        }

        if let Some(callback) = &options.on_limit_reached {
            callback(&LimitReached {
                identifier: identifier.to_string(),
                endpoint: endpoint.to_string(),
                total_requests: total,
                limit,
                reset_time,
            });
        }

        self.report(
            ViolationAction::RateLimitExceeded,
            Severity::Medium,
            identifier,
            endpoint,
            now,
            json!({
                "totalRequests": total,
                "limit": limit,
                "baseLimit": rule.max_requests,
                "resetTime": reset_time,
            }),
        );
    }

    async fn fail_open(
        &self,
        identifier: &str,
        endpoint: &str,
        rule: &RateRule,
        options: &RateLimitOptions,
        now: u64,
        error: &str,
    ) -> Decision {
        let message: String = error.chars().take(MAX_ERROR_DETAIL).collect();
        error!(
            identifier = %identifier,
            endpoint = %endpoint,
            error = %message,
            "Rate limiter failed, allowing request"
        );

        self.report(
            ViolationAction::GovernorError,
            Severity::High,
            identifier,
            endpoint,
            now,
            json!({ "error": message }),
        );

        let window_start = window::window_start(now, rule.window_ms, options.window_mode());
        let reset_time = window::bucket_start(now, rule.window_ms).saturating_add(rule.window_ms);
        Decision::full_quota(rule.max_requests, window_start, reset_time)
    }

    fn report(
        &self,
        action: ViolationAction,
        severity: Severity,
        identifier: &str,
        endpoint: &str,
        now: u64,
        details: serde_json::Value,
    ) {
        let event = ViolationEvent::new(action, severity, identifier, endpoint, now)
            .with_details(details);
        self.logger.report(event);
    }

    /// Wait until every violation event reported so far has been delivered
    /// or has timed out.
    pub async fn flush_events(&self) {
        self.logger.flush().await;
    }

    /// Retention sweep for a limiter with windows of `window_ms`: deletes
    /// counter records older than two windows and drops stale blacklist
    /// state.
    pub async fn sweep(&self, window_ms: u64) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        self.blacklist.sweep(now);
        let cutoff = now.saturating_sub(window_ms.saturating_mul(2));
        self.store.sweep_before(cutoff).await
    }

    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    pub fn penalties(&self) -> &PenaltyTracker {
        &self.penalties
    }

    pub fn blacklist(&self) -> &BlacklistGuard {
        &self.blacklist
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic: unknown payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingSink;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::rules::{BurstAllowance, PenaltyPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minute-aligned start time.
    const T0: u64 = 28_333_334 * 60_000;
    const MINUTE: u64 = 60_000;
    const IP: &str = "ip:1.2.3.4";
    const ENDPOINT: &str = "GET /api/x";

    struct DownBackend;

    #[async_trait]
    impl CounterBackend for DownBackend {
        async fn get(&self, _key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
            Err(StoreError::Unavailable("connection reset by peer".into()))
        }
        async fn upsert(&self, _record: &CounterRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection reset by peer".into()))
        }
        async fn sum_since(&self, _: &str, _: &str, _: u64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection reset by peer".into()))
        }
        async fn delete_before(&self, _cutoff: u64) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("connection reset by peer".into()))
        }
    }

    /// Reads work, writes fail.
    #[derive(Default)]
    struct ReadOnlyBackend {
        inner: MemoryBackend,
    }

    #[async_trait]
    impl CounterBackend for ReadOnlyBackend {
        async fn get(&self, key: &CounterKey) -> Result<Option<CounterRecord>, StoreError> {
            self.inner.get(key).await
        }
        async fn upsert(&self, _record: &CounterRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read-only replica".into()))
        }
        async fn sum_since(&self, i: &str, e: &str, c: u64) -> Result<u64, StoreError> {
            self.inner.sum_since(i, e, c).await
        }
        async fn delete_before(&self, cutoff: u64) -> Result<usize, StoreError> {
            self.inner.delete_before(cutoff).await
        }
    }

    struct Harness {
        governor: Governor,
        sink: Arc<RecordingSink>,
        clock: MockClock,
    }

    impl Harness {
        /// The recording sink, once every queued event has been delivered.
        async fn sink(&self) -> &RecordingSink {
            self.governor.flush_events().await;
            &self.sink
        }
    }

    fn harness_with(backend: Arc<dyn CounterBackend>) -> Harness {
        let sink = Arc::new(RecordingSink::new());
        let clock = MockClock::new(T0);
        let governor = Governor::new(
            backend,
            sink.clone(),
            Arc::new(clock.clone()),
            &GovernorConfig::default(),
        );
        Harness {
            governor,
            sink,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryBackend::new()))
    }

    fn rule(window_ms: u64, max_requests: u64) -> RateRule {
        RateRule::new(window_ms, max_requests).unwrap()
    }

    #[tokio::test]
    async fn test_quota_scenario() {
        let h = harness();
        let rule = rule(MINUTE, 3);
        let options = RateLimitOptions::default();

        for expected_remaining in [2, 1, 0] {
            let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
            assert!(d.allowed);
            assert_eq!(d.remaining_requests, expected_remaining);
            h.clock.advance(3_000);
        }

        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining_requests, 0);
        assert_eq!(d.total_requests, 4);
        assert_eq!(d.reason, Some(DenyReason::QuotaExceeded));
        assert_eq!(d.reset_time, T0 + MINUTE);
        assert_eq!(h.sink().await.count(ViolationAction::RateLimitExceeded), 1);
    }

    #[tokio::test]
    async fn test_fixed_window_rolls_over() {
        let h = harness();
        let rule = rule(MINUTE, 2);
        let options = RateLimitOptions::default();

        let first = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        h.clock.set(T0 + MINUTE - 1);
        let last = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert_eq!(first.window_start, last.window_start);
        assert_eq!(last.total_requests, 2);

        h.clock.set(T0 + MINUTE);
        let next = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert_eq!(next.window_start, T0 + MINUTE);
        assert_eq!(next.total_requests, 1);
        assert!(next.allowed);
    }

    #[tokio::test]
    async fn test_endpoints_and_identifiers_are_separate() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let options = RateLimitOptions::default();

        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        assert!(h.governor.admit(IP, "POST /api/x", &rule, &options).await.allowed);
        assert!(h.governor.admit("ip:5.6.7.8", ENDPOINT, &rule, &options).await.allowed);
        assert!(!h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
    }

    #[tokio::test]
    async fn test_progressive_penalty_shrinks_quota() {
        let h = harness();
        let rule = rule(MINUTE, 16);
        let options = RateLimitOptions {
            progressive_penalty: PenaltyPolicy {
                enabled: true,
                multiplier: 2.0,
                max_multiplier: 10.0,
                decay_ms: None,
            },
            ..RateLimitOptions::default()
        };

        for _ in 0..3 {
            h.governor
                .penalties()
                .record_violation(IP, &options.progressive_penalty, T0);
        }

        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert_eq!(d.limit, 2);
        assert_eq!(d.remaining_requests, 1);
    }

    #[tokio::test]
    async fn test_rejections_feed_penalty() {
        let h = harness();
        let rule = rule(MINUTE, 4);
        let options = RateLimitOptions {
            progressive_penalty: PenaltyPolicy {
                enabled: true,
                ..PenaltyPolicy::default()
            },
            ..RateLimitOptions::default()
        };

        for _ in 0..5 {
            h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        }
        let policy = &options.progressive_penalty;
        assert_eq!(h.governor.penalties().violation_count(IP, policy, T0), 1);

        // Next window: quota halved to 2.
        h.clock.advance(MINUTE);
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert_eq!(d.limit, 2);
        assert!(d.allowed);
    }

    #[tokio::test]
    async fn test_burst_rejection_does_not_count() {
        let h = harness();
        h.clock.set(T0 + 1_000);
        let rule = rule(MINUTE, 100);
        let options = RateLimitOptions {
            burst_allowance: Some(BurstAllowance {
                max_burst: 2,
                burst_window_ms: 10_000,
            }),
            ..RateLimitOptions::default()
        };

        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);

        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::BurstExceeded));
        assert_eq!(d.reset_time, T0 + 1_000 + 10_000);
        assert_eq!(d.total_requests, 2);

        let key = CounterKey::new(IP, ENDPOINT, T0);
        assert_eq!(h.governor.store().cached(&key).unwrap().requests_count, 2);
        assert_eq!(h.sink().await.count(ViolationAction::BurstLimitExceeded), 1);
        assert_eq!(h.sink().await.count(ViolationAction::RateLimitExceeded), 0);
        assert_eq!(h.governor.blacklist().violations_last_hour(IP, T0 + 1_000), 0);
    }

    #[tokio::test]
    async fn test_burst_cap_holds_late_in_window() {
        let h = harness();
        h.clock.set(T0 + 30_000);
        let rule = rule(MINUTE, 100);
        let options = RateLimitOptions {
            burst_allowance: Some(BurstAllowance {
                max_burst: 2,
                burst_window_ms: 10_000,
            }),
            ..RateLimitOptions::default()
        };

        let mut allowed = 0;
        for _ in 0..20 {
            if h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
        assert_eq!(h.sink().await.count(ViolationAction::BurstLimitExceeded), 18);

        // Once the burst interval has passed, the same window admits again.
        h.clock.set(T0 + 41_000);
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(d.allowed);
        assert_eq!(d.total_requests, 3);
    }

    #[tokio::test]
    async fn test_reported_events_do_not_block_admission() {
        struct SlowSink;

        #[async_trait]
        impl ViolationSink for SlowSink {
            async fn notify(&self, _event: &ViolationEvent) -> Result<(), crate::error::SinkError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }

        let config = GovernorConfig {
            sink_timeout_ms: 60_000,
            ..GovernorConfig::default()
        };
        let governor = Governor::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(SlowSink),
            Arc::new(MockClock::new(T0)),
            &config,
        );
        let rule = rule(MINUTE, 1);
        let options = RateLimitOptions::default();

        let started = std::time::Instant::now();
        for _ in 0..5 {
            governor.admit(IP, ENDPOINT, &rule, &options).await;
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_blacklist_lifecycle() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let options = RateLimitOptions::default();

        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        for _ in 0..5 {
            let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
            assert_eq!(d.reason, Some(DenyReason::QuotaExceeded));
        }
        assert_eq!(h.sink().await.count(ViolationAction::BlacklistAdded), 1);

        let added = h
            .sink()
            .await
            .events()
            .into_iter()
            .find(|e| e.action == ViolationAction::BlacklistAdded)
            .unwrap();
        assert_eq!(added.severity, Severity::High);

        h.clock.advance(MINUTE);
        let now = h.clock.now_ms();
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::Blacklisted));
        assert_eq!(d.reset_time, now + 10 * MINUTE);
        assert_eq!(h.sink().await.count(ViolationAction::Blacklisted), 1);

        // Past the expiry, normal quota logic resumes.
        h.clock.set(T0 + 11 * MINUTE);
        assert!(!h
            .governor
            .blacklist()
            .is_blacklisted(IP, &options.blacklist, h.clock.now_ms()));
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(d.allowed);
        assert_eq!(d.total_requests, 1);
    }

    #[tokio::test]
    async fn test_static_blacklist() {
        let h = harness();
        let rule = rule(MINUTE, 10);
        let options = RateLimitOptions {
            blacklist: [IP.to_string()].into_iter().collect(),
            ..RateLimitOptions::default()
        };

        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(!d.allowed);
        assert_eq!(d.reason, Some(DenyReason::Blacklisted));
        assert_eq!(d.reset_time, T0 + 10 * MINUTE);
        assert_eq!(h.governor.store().cache_len(), 0);
    }

    #[tokio::test]
    async fn test_whitelist_bypasses_everything() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let options = RateLimitOptions {
            whitelist: [IP.to_string()].into_iter().collect(),
            blacklist: [IP.to_string()].into_iter().collect(),
            progressive_penalty: PenaltyPolicy {
                enabled: true,
                ..PenaltyPolicy::default()
            },
            ..RateLimitOptions::default()
        };

        for _ in 0..10 {
            let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
            assert!(d.allowed);
            assert_eq!(d.remaining_requests, 1);
        }

        assert_eq!(h.governor.store().cache_len(), 0);
        assert_eq!(h.governor.penalties().tracked(), 0);
        assert!(h.governor.blacklist().is_empty());
        assert!(h.sink().await.events().is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let h = harness_with(Arc::new(DownBackend));
        let rule = rule(MINUTE, 3);
        let options = RateLimitOptions::default();

        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(d.allowed);
        assert_eq!(d.remaining_requests, 3);

        let events = h.sink().await.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, ViolationAction::GovernorError);
        assert_eq!(events[0].severity, Severity::High);
        assert!(events[0].details["error"]
            .as_str()
            .unwrap()
            .contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_decision_and_cache() {
        let h = harness_with(Arc::new(ReadOnlyBackend::default()));
        let rule = rule(MINUTE, 3);
        let options = RateLimitOptions::default();

        let first = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        let second = h.governor.admit(IP, ENDPOINT, &rule, &options).await;

        assert!(first.allowed && second.allowed);
        assert_eq!(second.total_requests, 2);
        assert_eq!(h.sink().await.count(ViolationAction::GovernorError), 0);
    }

    #[tokio::test]
    async fn test_panic_fails_open() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let options =
            RateLimitOptions::default().with_on_limit_reached(|_| panic!("callback exploded"));

        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;

        assert!(d.allowed);
        assert_eq!(d.remaining_requests, 1);
        let events = h.sink().await.events();
        let failure = events
            .iter()
            .find(|e| e.action == ViolationAction::GovernorError)
            .unwrap();
        assert!(failure.details["error"]
            .as_str()
            .unwrap()
            .contains("callback exploded"));
    }

    #[tokio::test]
    async fn test_fail_open_truncates_error_text() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let long = "x".repeat(10_000);
        let options = RateLimitOptions::default().with_on_limit_reached(move |_| panic!("{}", long));

        h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        h.governor.admit(IP, ENDPOINT, &rule, &options).await;

        let events = h.sink().await.events();
        let failure = events
            .iter()
            .find(|e| e.action == ViolationAction::GovernorError)
            .unwrap();
        assert_eq!(
            failure.details["error"].as_str().unwrap().chars().count(),
            MAX_ERROR_DETAIL
        );
    }

    #[tokio::test]
    async fn test_on_limit_reached_receives_context() {
        let h = harness();
        let rule = rule(MINUTE, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let options = RateLimitOptions::default().with_on_limit_reached(move |ctx| {
            assert_eq!(ctx.identifier, IP);
            assert_eq!(ctx.total_requests, 2);
            assert_eq!(ctx.limit, 1);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;

        assert!(!d.allowed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_carries_previous_bucket() {
        let h = harness();
        let rule = rule(MINUTE, 5);
        let options = RateLimitOptions {
            sliding_window: true,
            ..RateLimitOptions::default()
        };

        h.clock.set(T0 + 50_000);
        for _ in 0..5 {
            assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        }

        // 15s into the next bucket, 3 of the previous 5 still count.
        h.clock.set(T0 + MINUTE + 15_000);
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(d.allowed);
        assert_eq!(d.total_requests, 4);
        assert_eq!(d.window_start, T0 + 15_000);

        assert!(h.governor.admit(IP, ENDPOINT, &rule, &options).await.allowed);
        let d = h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        assert!(!d.allowed);
        assert_eq!(d.total_requests, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_over_admit() {
        let h = harness();
        let governor = Arc::new(h.governor);
        let rule = Arc::new(rule(MINUTE, 10));
        let options = Arc::new(RateLimitOptions::default());

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let governor = governor.clone();
                let rule = rule.clone();
                let options = options.clone();
                tokio::spawn(async move { governor.admit(IP, ENDPOINT, &rule, &options).await })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap().allowed {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 10);
        let key = CounterKey::new(IP, ENDPOINT, T0);
        assert_eq!(governor.store().cached(&key).unwrap().requests_count, 50);
    }

    #[tokio::test]
    async fn test_sweep_removes_old_windows() {
        let h = harness();
        let rule = rule(MINUTE, 10);
        let options = RateLimitOptions::default();

        h.governor.admit(IP, ENDPOINT, &rule, &options).await;
        h.clock.advance(3 * MINUTE);
        h.governor.admit(IP, ENDPOINT, &rule, &options).await;

        let removed = h.governor.sweep(MINUTE).await.unwrap();
        assert_eq!(removed, 1);
        assert!(h.governor.store().cached(&CounterKey::new(IP, ENDPOINT, T0)).is_none());
    }
}

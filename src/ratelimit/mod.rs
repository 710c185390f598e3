//! Rate limiting logic and state management.

mod backend;
mod blacklist;
mod burst;
mod clock;
mod counter;
mod decision;
mod governor;
mod limiter;
mod penalty;
mod rules;
mod store;
mod window;

pub use backend::{CounterBackend, MemoryBackend};
pub use blacklist::{
    BlacklistAction, BlacklistEntry, BlacklistGuard, BLACKLIST_WINDOWS, VIOLATION_LOOKBACK_MS,
    VIOLATION_THRESHOLD,
};
pub use burst::{BurstCheck, BurstGuard};
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterKey, CounterRecord};
pub use decision::{Decision, DenyReason};
pub use governor::Governor;
pub use limiter::{Limiter, LimiterRegistry};
pub use penalty::PenaltyTracker;
pub use rules::{
    BurstAllowance, LimitCallback, LimitReached, LimiterConfig, PenaltyPolicy, RateLimitOptions,
    RateRule,
};
pub use store::{CounterStore, CounterStoreConfig};
pub use window::{bucket_start, rolling_count, window_start, WindowMode};

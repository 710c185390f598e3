//! Time source for the governor.
//!
//! All window, burst and blacklist arithmetic uses unix epoch milliseconds
//! obtained through [`Clock`], so tests can drive time explicitly.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

/// Port for obtaining the current wall-clock time.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the unix epoch.
    fn now_ms(&self) -> u64;
}

/// System clock backed by `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        // Pre-epoch system time clamps to zero.
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Controllable clock for tests.
///
/// Clones share the same underlying time, so advancing one clone is visible
/// through every other clone (including the one held by a `Governor`).
#[derive(Debug, Clone)]
pub struct MockClock {
    current_ms: Arc<Mutex<u64>>,
}

impl MockClock {
    /// Create a mock clock starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            current_ms: Arc::new(Mutex::new(start_ms)),
        }
    }

    /// Advance the clock by `ms` milliseconds.
    pub fn advance(&self, ms: u64) {
        *self.current_ms.lock() += ms;
    }

    /// Set the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        *self.current_ms.lock() = now_ms;
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        *self.current_ms.lock()
    }
}

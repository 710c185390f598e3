//! Window boundary arithmetic.

use serde::{Deserialize, Serialize};

/// How a window's start boundary is derived from "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Boundaries aligned to absolute multiples of the window length,
    /// shared by every identifier.
    #[default]
    Fixed,
    /// Boundary recomputed relative to "now" on every check.
    Sliding,
}

impl WindowMode {
    /// Map the `slidingWindow` flag onto a mode.
    pub fn from_sliding(sliding: bool) -> Self {
        if sliding {
            WindowMode::Sliding
        } else {
            WindowMode::Fixed
        }
    }
}

/// Compute the start of the window containing `now_ms`.
///
/// Fixed mode floors to a multiple of `window_ms`. Sliding mode returns
/// `now_ms - window_ms`, so two calls a few milliseconds apart report
/// different origins; the governor counts sliding windows through
/// [`bucket_start`] and [`rolling_count`] instead of keying on this value.
pub fn window_start(now_ms: u64, window_ms: u64, mode: WindowMode) -> u64 {
    match mode {
        WindowMode::Fixed => bucket_start(now_ms, window_ms),
        WindowMode::Sliding => now_ms.saturating_sub(window_ms),
    }
}

/// Fixed-aligned bucket boundary for `now_ms`. A zero-length window maps
/// every instant to its own bucket.
pub fn bucket_start(now_ms: u64, window_ms: u64) -> u64 {
    if window_ms == 0 {
        return now_ms;
    }
    (now_ms / window_ms) * window_ms
}

/// Two-bucket rolling estimate of requests in the trailing window.
///
/// The previous bucket contributes in proportion to how much of it still
/// overlaps `[now - window, now]`.
pub fn rolling_count(previous: u64, current: u64, now_ms: u64, window_ms: u64) -> u64 {
    if window_ms == 0 {
        return current;
    }
    let elapsed = now_ms - bucket_start(now_ms, window_ms);
    let overlap = window_ms - elapsed;
    let weighted = (previous as u128 * overlap as u128) / window_ms as u128;
    weighted as u64 + current
}

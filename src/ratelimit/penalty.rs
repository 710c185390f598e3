//! Progressive penalties for repeat offenders.
//!
//! Each rejected request increments an identifier's violation count, and
//! the allowed quota shrinks exponentially with that count. The quota never
//! drops below one request per window; full denial is the blacklist's job.

use dashmap::DashMap;
use tracing::debug;

use super::rules::PenaltyPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PenaltyState {
    violation_count: u32,
    last_violation_ms: u64,
}

/// Per-identifier violation counters.
#[derive(Debug, Default)]
pub struct PenaltyTracker {
    states: DashMap<String, PenaltyState>,
}

impl PenaltyTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Quota left after applying the penalty multiplier for `identifier`.
    ///
    /// `max(1, floor(base / min(multiplier ^ violations, max_multiplier)))`,
    /// or `base` unchanged when the policy is disabled.
    pub fn effective_quota(
        &self,
        identifier: &str,
        base_quota: u64,
        policy: &PenaltyPolicy,
        now_ms: u64,
    ) -> u64 {
        if !policy.enabled {
            return base_quota;
        }

        let violations = self.violation_count(identifier, policy, now_ms);
        if violations == 0 {
            return base_quota;
        }

        let multiplier = policy
            .multiplier
            .powi(violations.min(i32::MAX as u32) as i32)
            .min(policy.max_multiplier);
        let reduced = (base_quota as f64 / multiplier).floor() as u64;
        reduced.max(1)
    }

    /// Count one more violation and return the new total.
    pub fn record_violation(&self, identifier: &str, policy: &PenaltyPolicy, now_ms: u64) -> u32 {
        let mut state = self.states.entry(identifier.to_string()).or_default();
        if is_decayed(&state, policy, now_ms) {
            state.violation_count = 0;
        }
        state.violation_count = state.violation_count.saturating_add(1);
        state.last_violation_ms = now_ms;

        debug!(
            identifier = %identifier,
            violations = state.violation_count,
            "Recorded rate limit violation"
        );
        state.violation_count
    }

    /// Current violation count, honouring the policy's decay if any.
    pub fn violation_count(&self, identifier: &str, policy: &PenaltyPolicy, now_ms: u64) -> u32 {
        let state = match self.states.get(identifier) {
            Some(state) => *state,
            None => return 0,
        };

        if is_decayed(&state, policy, now_ms) {
            self.states
                .remove_if(identifier, |_, s| is_decayed(s, policy, now_ms));
            return 0;
        }
        state.violation_count
    }

    /// Number of identifiers with recorded violations.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

fn is_decayed(state: &PenaltyState, policy: &PenaltyPolicy, now_ms: u64) -> bool {
    match policy.decay_ms {
        Some(decay) => now_ms.saturating_sub(state.last_violation_ms) >= decay,
        None => false,
    }
}

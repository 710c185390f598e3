//! Temporary deny-list for identifiers that keep hitting their limits.
//!
//! Every quota rejection is logged per identifier. Once an identifier has
//! [`VIOLATION_THRESHOLD`] rejections within the trailing hour it is
//! blacklisted for ten windows. Entries expire lazily on lookup and eagerly
//! through a timer task scheduled at the expiry instant.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

/// Rejections within the lookback that trigger a blacklist entry.
pub const VIOLATION_THRESHOLD: usize = 5;

/// Lookback for counting rejections.
pub const VIOLATION_LOOKBACK_MS: u64 = 60 * 60 * 1000;

/// Blacklist duration, in multiples of the limiter's window.
pub const BLACKLIST_WINDOWS: u64 = 10;

/// An identifier denied until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub identifier: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl BlacklistEntry {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

/// Result of evaluating an identifier after a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlacklistAction {
    /// Below threshold, or already blacklisted.
    Unchanged { violations_last_hour: usize },
    /// A new entry was created.
    Added(BlacklistEntry),
}

/// Dynamic blacklist plus the rejection log that feeds it.
#[derive(Debug, Default)]
pub struct BlacklistGuard {
    entries: Arc<DashMap<String, BlacklistEntry>>,
    violations: DashMap<String, VecDeque<u64>>,
}

impl BlacklistGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `identifier` is denied, checking the static list first and
    /// then the dynamic entries. Expired entries are dropped on the way.
    pub fn is_blacklisted(&self, identifier: &str, static_list: &HashSet<String>, now_ms: u64) -> bool {
        if static_list.contains(identifier) {
            return true;
        }
        self.active_entry(identifier, now_ms).is_some()
    }

    /// The live dynamic entry for `identifier`, if any.
    pub fn active_entry(&self, identifier: &str, now_ms: u64) -> Option<BlacklistEntry> {
        let entry = self.entries.get(identifier).map(|e| e.value().clone())?;
        if entry.is_expired(now_ms) {
            self.entries
                .remove_if(identifier, |_, e| e.is_expired(now_ms));
            debug!(identifier = %identifier, "Blacklist entry expired");
            return None;
        }
        Some(entry)
    }

    /// Log a rejection for `identifier` and blacklist it if the trailing
    /// hour now holds at least [`VIOLATION_THRESHOLD`] rejections.
    pub fn evaluate(&self, identifier: &str, window_ms: u64, now_ms: u64) -> BlacklistAction {
        let violations_last_hour = {
            let mut log = self.violations.entry(identifier.to_string()).or_default();
            log.push_back(now_ms);
            prune(&mut log, now_ms);
            log.len()
        };

        if violations_last_hour < VIOLATION_THRESHOLD
            || self.active_entry(identifier, now_ms).is_some()
        {
            return BlacklistAction::Unchanged {
                violations_last_hour,
            };
        }

        let entry = BlacklistEntry {
            identifier: identifier.to_string(),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(BLACKLIST_WINDOWS.saturating_mul(window_ms)),
        };
        self.entries.insert(identifier.to_string(), entry.clone());
        self.schedule_expiry(&entry, now_ms);

        info!(
            identifier = %identifier,
            violations_last_hour = violations_last_hour,
            expires_at = entry.expires_at,
            "Identifier blacklisted"
        );
        BlacklistAction::Added(entry)
    }

    /// Rejections recorded for `identifier` within the trailing hour.
    pub fn violations_last_hour(&self, identifier: &str, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(VIOLATION_LOOKBACK_MS);
        self.violations
            .get(identifier)
            .map(|log| log.iter().filter(|&&t| t >= cutoff).count())
            .unwrap_or(0)
    }

    /// Number of dynamic entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries and rejection logs that fell out of the lookback.
    pub fn sweep(&self, now_ms: u64) {
        self.entries.retain(|_, e| !e.is_expired(now_ms));
        self.violations.retain(|_, log| {
            prune(log, now_ms);
            !log.is_empty()
        });
    }

    fn schedule_expiry(&self, entry: &BlacklistEntry, now_ms: u64) {
        // Without a runtime the lazy check on lookup still applies.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let entries = Arc::clone(&self.entries);
        let identifier = entry.identifier.clone();
        let expires_at = entry.expires_at;
        let delay = Duration::from_millis(expires_at.saturating_sub(now_ms));

        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // A re-blacklisted identifier carries a different expiry.
            if entries
                .remove_if(&identifier, |_, e| e.expires_at == expires_at)
                .is_some()
            {
                debug!(identifier = %identifier, "Blacklist entry evicted by timer");
            }
        });
    }
}

fn prune(log: &mut VecDeque<u64>, now_ms: u64) {
    let cutoff = now_ms.saturating_sub(VIOLATION_LOOKBACK_MS);
    while log.front().is_some_and(|&t| t < cutoff) {
        log.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 60_000;

    #[test]
    fn test_static_list_checked_first() {
        let guard = BlacklistGuard::new();
        let static_list: HashSet<String> = ["ip:6.6.6.6".to_string()].into_iter().collect();

        assert!(guard.is_blacklisted("ip:6.6.6.6", &static_list, 0));
        assert!(!guard.is_blacklisted("ip:1.1.1.1", &static_list, 0));
    }

    #[test]
    fn test_threshold_blacklists_on_fifth_violation() {
        let guard = BlacklistGuard::new();
        let none = HashSet::new();

        for i in 0..4 {
            let action = guard.evaluate("ip:1.2.3.4", WINDOW, 1_000 + i);
            assert_eq!(
                action,
                BlacklistAction::Unchanged {
                    violations_last_hour: (i + 1) as usize
                }
            );
        }
        assert!(!guard.is_blacklisted("ip:1.2.3.4", &none, 1_004));

        let action = guard.evaluate("ip:1.2.3.4", WINDOW, 1_005);
        match action {
            BlacklistAction::Added(entry) => {
                assert_eq!(entry.expires_at, 1_005 + 10 * WINDOW);
            }
            other => panic!("expected blacklist entry, got {:?}", other),
        }
        assert!(guard.is_blacklisted("ip:1.2.3.4", &none, 1_006));
    }

    #[test]
    fn test_violations_outside_lookback_do_not_count() {
        let guard = BlacklistGuard::new();

        for i in 0..4 {
            guard.evaluate("user:9", WINDOW, i);
        }
        let later = VIOLATION_LOOKBACK_MS + 10;
        let action = guard.evaluate("user:9", WINDOW, later);

        assert_eq!(
            action,
            BlacklistAction::Unchanged {
                violations_last_hour: 1
            }
        );
        assert_eq!(guard.violations_last_hour("user:9", later), 1);
    }

    #[test]
    fn test_entry_expires_lazily() {
        let guard = BlacklistGuard::new();
        let none = HashSet::new();
        for i in 0..5 {
            guard.evaluate("user:1", WINDOW, i);
        }

        let expiry = 4 + 10 * WINDOW;
        assert!(guard.is_blacklisted("user:1", &none, expiry - 1));
        assert!(!guard.is_blacklisted("user:1", &none, expiry));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_already_blacklisted_is_not_re_added() {
        let guard = BlacklistGuard::new();
        for i in 0..5 {
            guard.evaluate("user:1", WINDOW, i);
        }

        let action = guard.evaluate("user:1", WINDOW, 10);
        assert!(matches!(action, BlacklistAction::Unchanged { .. }));
        assert_eq!(guard.active_entry("user:1", 10).unwrap().expires_at, 4 + 10 * WINDOW);
    }

    #[test]
    fn test_sweep_drops_stale_state() {
        let guard = BlacklistGuard::new();
        for i in 0..5 {
            guard.evaluate("user:1", WINDOW, i);
        }

        guard.sweep(VIOLATION_LOOKBACK_MS + 10);

        assert!(guard.is_empty());
        assert_eq!(guard.violations_last_hour("user:1", VIOLATION_LOOKBACK_MS + 10), 0);
    }

    #[tokio::test]
    async fn test_timer_evicts_entry() {
        let guard = BlacklistGuard::new();
        for _ in 0..5 {
            // 10 windows of 5ms.
            guard.evaluate("user:1", 5, 0);
        }
        assert_eq!(guard.len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(guard.len(), 0);
    }
}

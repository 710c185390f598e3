//! Named limiters and the registry that serves them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::decision::Decision;
use super::governor::Governor;
use super::rules::{LimiterConfig, RateLimitOptions, RateRule};
use crate::error::{Result, WardenError};

/// One configured limiter: a rule and options bound to the shared governor.
///
/// Cheap to clone. Every clone shares the governor's counters, penalties and
/// blacklist.
#[derive(Clone)]
pub struct Limiter {
    name: Arc<str>,
    rule: RateRule,
    options: Arc<RateLimitOptions>,
    governor: Arc<Governor>,
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("rule", &self.rule)
            .field("options", &self.options)
            .finish()
    }
}

impl Limiter {
    /// Build a limiter, validating its configuration up front.
    pub fn new(name: &str, config: LimiterConfig, governor: Arc<Governor>) -> Result<Self> {
        let (rule, options) = config
            .into_parts()
            .map_err(|e| WardenError::Config(format!("limiter '{}': {}", name, e)))?;

        debug!(
            limiter = %name,
            window_ms = rule.window_ms,
            max_requests = rule.max_requests,
            mode = ?options.window_mode(),
            "Created limiter"
        );

        Ok(Self {
            name: Arc::from(name),
            rule,
            options: Arc::new(options),
            governor,
        })
    }

    /// Admit or reject one request from `identifier` to `endpoint`.
    pub async fn check(&self, identifier: &str, endpoint: &str) -> Decision {
        self.governor
            .admit(identifier, endpoint, &self.rule, &self.options)
            .await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule(&self) -> &RateRule {
        &self.rule
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    /// Epoch milliseconds according to the governor's clock.
    pub fn now_ms(&self) -> u64 {
        self.governor.clock().now_ms()
    }
}

/// Limiters by name, swappable at runtime.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: RwLock<HashMap<String, Limiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every limiter in `configs` against `governor`.
    pub fn from_config(
        configs: &HashMap<String, LimiterConfig>,
        governor: Arc<Governor>,
    ) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(configs, governor)?;
        Ok(registry)
    }

    /// Look up a limiter by name.
    pub fn get(&self, name: &str) -> Option<Limiter> {
        self.limiters.read().get(name).cloned()
    }

    /// Atomically swap in a new set of limiters. Nothing changes if any
    /// definition is invalid.
    pub fn replace_all(
        &self,
        configs: &HashMap<String, LimiterConfig>,
        governor: Arc<Governor>,
    ) -> Result<()> {
        let mut built = HashMap::with_capacity(configs.len());
        for (name, config) in configs {
            let limiter = Limiter::new(name, config.clone(), Arc::clone(&governor))?;
            built.insert(name.clone(), limiter);
        }

        let count = built.len();
        *self.limiters.write() = built;
        info!(limiters = count, "Limiter set replaced");
        Ok(())
    }

    /// Snapshot of all limiters.
    pub fn all(&self) -> Vec<Limiter> {
        self.limiters.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }
}

//! Limiter rules and per-invocation options.
//!
//! A limiter is described by an immutable [`RateRule`] (window length and
//! base quota) plus [`RateLimitOptions`] (window mode, penalties, burst cap,
//! static allow/deny lists). Both are validated when a limiter is built so
//! that bad configuration fails at startup rather than per request.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::window::WindowMode;
use crate::error::{Result, WardenError};

/// Window length and base quota for one endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    /// Length of the counting window in milliseconds
    pub window_ms: u64,
    /// Base quota per window
    pub max_requests: u64,
    /// Caller-evaluated: do not count requests that succeeded
    #[serde(default)]
    pub skip_successful: bool,
    /// Caller-evaluated: do not count requests that failed
    #[serde(default)]
    pub skip_failed: bool,
}

impl RateRule {
    /// Create a validated rule.
    pub fn new(window_ms: u64, max_requests: u64) -> Result<Self> {
        let rule = Self {
            window_ms,
            max_requests,
            skip_successful: false,
            skip_failed: false,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Reject rules that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(WardenError::Config("window_ms must be greater than 0".into()));
        }
        if self.max_requests == 0 {
            return Err(WardenError::Config(
                "max_requests must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Whether a request with the given outcome should count against the
    /// window, per the skip flags. Callers evaluate this once the real
    /// outcome is known; admission itself ignores it.
    pub fn counts_outcome(&self, success: bool) -> bool {
        if success {
            !self.skip_successful
        } else {
            !self.skip_failed
        }
    }
}

/// Quota-shrinking policy for repeat offenders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Base of the exponential reduction
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Ceiling on the reduction factor
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
    /// Forget violations older than this; `None` never forgets
    #[serde(default)]
    pub decay_ms: Option<u64>,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            multiplier: default_multiplier(),
            max_multiplier: default_max_multiplier(),
            decay_ms: None,
        }
    }
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_multiplier() -> f64 {
    10.0
}

/// Secondary short-horizon cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstAllowance {
    pub max_burst: u64,
    pub burst_window_ms: u64,
}

/// Context handed to an `on_limit_reached` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitReached {
    pub identifier: String,
    pub endpoint: String,
    pub total_requests: u64,
    pub limit: u64,
    pub reset_time: u64,
}

/// Caller hook invoked after a quota rejection.
pub type LimitCallback = Arc<dyn Fn(&LimitReached) + Send + Sync>;

/// Per-invocation limiter options. Every field has a default.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RateLimitOptions {
    #[serde(default)]
    pub sliding_window: bool,
    #[serde(default)]
    pub progressive_penalty: PenaltyPolicy,
    #[serde(default)]
    pub burst_allowance: Option<BurstAllowance>,
    /// Identifiers that bypass every check
    #[serde(default)]
    pub whitelist: HashSet<String>,
    /// Identifiers that are always rejected
    #[serde(default)]
    pub blacklist: HashSet<String>,
    #[serde(skip)]
    pub on_limit_reached: Option<LimitCallback>,
}

impl std::fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("sliding_window", &self.sliding_window)
            .field("progressive_penalty", &self.progressive_penalty)
            .field("burst_allowance", &self.burst_allowance)
            .field("whitelist", &self.whitelist)
            .field("blacklist", &self.blacklist)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

impl RateLimitOptions {
    /// Window mode selected by `sliding_window`.
    pub fn window_mode(&self) -> WindowMode {
        WindowMode::from_sliding(self.sliding_window)
    }

    /// Attach a callback run after every quota rejection.
    pub fn with_on_limit_reached(
        mut self,
        callback: impl Fn(&LimitReached) + Send + Sync + 'static,
    ) -> Self {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// Reject option sets that are meaningless.
    pub fn validate(&self) -> Result<()> {
        let penalty = &self.progressive_penalty;
        if penalty.enabled {
            if !penalty.multiplier.is_finite() || penalty.multiplier < 1.0 {
                return Err(WardenError::Config(format!(
                    "progressive_penalty.multiplier must be >= 1, got {}",
                    penalty.multiplier
                )));
            }
            if !penalty.max_multiplier.is_finite() || penalty.max_multiplier < 1.0 {
                return Err(WardenError::Config(format!(
                    "progressive_penalty.max_multiplier must be >= 1, got {}",
                    penalty.max_multiplier
                )));
            }
        }

        if let Some(burst) = &self.burst_allowance {
            if burst.max_burst == 0 || burst.burst_window_ms == 0 {
                return Err(WardenError::Config(
                    "burst_allowance requires max_burst and burst_window_ms greater than 0".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Serialized form of one named limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(flatten)]
    pub rule: RateRule,
    #[serde(flatten)]
    pub options: RateLimitOptions,
}

impl LimiterConfig {
    /// Parse a single limiter definition from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Validate and split into rule and options.
    pub fn into_parts(self) -> Result<(RateRule, RateLimitOptions)> {
        self.rule.validate()?;
        self.options.validate()?;
        Ok((self.rule, self.options))
    }
}

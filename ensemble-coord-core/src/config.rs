//! Coordination settings and retry policy
//!
//! Every bound the protocol relies on lives here as explicit, validated
//! configuration: heartbeat cadence and timeout, tolerated clock skew,
//! queue backpressure, lock retry bounds and clarification polling.
//!
//! # Examples
//!
//! ```rust
//! use ensemble_coord_core::config::*;
//!
//! let settings = CoordinationSettings::builder()
//!     .heartbeat_interval_seconds(5)
//!     .heartbeat_timeout_seconds(30)
//!     .max_pending_items(1_000)
//!     .lock_retry(RetryPolicy::new(10, 50, 2.0, 1_000).unwrap())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(settings.heartbeat_timeout_seconds, 30);
//! ```

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default answer used when a clarification request times out
pub const DEFAULT_CLARIFICATION_ANSWER: &str =
    "No answer received in time; proceed with best judgment.";

/// Upper bound for any duration setting expressed in seconds (100 years)
pub const MAX_DURATION_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Settings shared by every agent operating on one store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinationSettings {
    /// How often a live agent heartbeats
    pub heartbeat_interval_seconds: u64,
    /// Silence after which an agent is presumed dead
    pub heartbeat_timeout_seconds: u64,
    /// Added to the heartbeat timeout before declaring an agent dead
    pub clock_skew_tolerance_seconds: u64,
    /// Cadence of the background sweep loop
    pub sweep_interval_seconds: u64,
    /// Lease on the per-agent lock a sweeper holds while reclaiming
    pub sweep_lock_lease_seconds: u64,
    /// Priority assigned when an item is enqueued without one
    pub default_priority: i64,
    /// Optional backpressure bound on the pending partition
    pub max_pending_items: Option<usize>,
    /// Lease applied to work item locks, `None` for no expiry
    pub default_lease_seconds: Option<u64>,
    /// Bounds for `LockManager::acquire_with_retry`
    pub lock_retry: RetryPolicy,
    /// Sleep between empty claims in the worker loop
    pub claim_poll_interval_ms: u64,
    /// Sleep between polls while waiting for a clarification answer
    pub clarification_poll_interval_ms: u64,
    /// Answer returned to the caller when a clarification times out
    pub clarification_default_answer: String,
}

/// Retry policy with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Total wall time budget across all attempts
    pub max_wait_ms: Option<u64>,
    /// Randomize each delay by up to half its length
    pub jitter: bool,
}

impl CoordinationSettings {
    /// Create a new coordination settings builder
    pub fn builder() -> CoordinationSettingsBuilder {
        CoordinationSettingsBuilder::new()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(Error::validation(
                "Heartbeat interval must be greater than 0",
            ));
        }
        if self.heartbeat_timeout_seconds == 0 {
            return Err(Error::validation("Heartbeat timeout must be greater than 0"));
        }
        let timed = [
            ("Heartbeat interval", self.heartbeat_interval_seconds),
            ("Heartbeat timeout", self.heartbeat_timeout_seconds),
            ("Clock skew tolerance", self.clock_skew_tolerance_seconds),
            ("Sweep interval", self.sweep_interval_seconds),
            ("Sweep lock lease", self.sweep_lock_lease_seconds),
            ("Default lease", self.default_lease_seconds.unwrap_or(0)),
        ];
        for (name, seconds) in timed {
            if seconds > MAX_DURATION_SECONDS {
                return Err(Error::validation(format!(
                    "{name} ({seconds}s) exceeds the maximum of {MAX_DURATION_SECONDS}s"
                )));
            }
        }
        if self.heartbeat_interval_seconds.saturating_mul(2) >= self.heartbeat_timeout_seconds {
            return Err(Error::validation(format!(
                "Heartbeat interval ({}s) must be less than half the heartbeat timeout ({}s)",
                self.heartbeat_interval_seconds, self.heartbeat_timeout_seconds
            )));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(Error::validation("Sweep interval must be greater than 0"));
        }
        if self.sweep_lock_lease_seconds == 0 {
            return Err(Error::validation("Sweep lock lease must be greater than 0"));
        }
        if self.max_pending_items == Some(0) {
            return Err(Error::validation(
                "Max pending items must be greater than 0 when set",
            ));
        }
        if self.default_lease_seconds == Some(0) {
            return Err(Error::validation("Default lease must be greater than 0 when set"));
        }
        if self.claim_poll_interval_ms == 0 || self.clarification_poll_interval_ms == 0 {
            return Err(Error::validation("Poll intervals must be greater than 0"));
        }
        if self.clarification_default_answer.trim().is_empty() {
            return Err(Error::validation(
                "Clarification default answer cannot be empty",
            ));
        }
        self.lock_retry.validate()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn claim_poll_interval(&self) -> Duration {
        Duration::from_millis(self.claim_poll_interval_ms)
    }

    pub fn clarification_poll_interval(&self) -> Duration {
        Duration::from_millis(self.clarification_poll_interval_ms)
    }

    /// Silence after which an agent is declared dead, skew included
    pub fn staleness_threshold(&self) -> chrono::Duration {
        let seconds = self
            .heartbeat_timeout_seconds
            .saturating_add(self.clock_skew_tolerance_seconds)
            .min(2 * MAX_DURATION_SECONDS);
        chrono::Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX / 1_000))
    }
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 10,
            heartbeat_timeout_seconds: 60,
            clock_skew_tolerance_seconds: 5,
            sweep_interval_seconds: 15,
            sweep_lock_lease_seconds: 30,
            default_priority: 5,
            max_pending_items: None,
            default_lease_seconds: None,
            lock_retry: RetryPolicy::default(),
            claim_poll_interval_ms: 1_000,
            clarification_poll_interval_ms: 500,
            clarification_default_answer: DEFAULT_CLARIFICATION_ANSWER.to_string(),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(
        max_attempts: u32,
        initial_delay_ms: u64,
        backoff_multiplier: f64,
        max_delay_ms: u64,
    ) -> Result<Self> {
        let policy = Self {
            max_attempts,
            initial_delay_ms,
            backoff_multiplier,
            max_delay_ms,
            max_wait_ms: None,
            jitter: false,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Bound the policy by total elapsed time instead of attempts alone
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = Some(max_wait.as_millis() as u64);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("Max attempts must be greater than 0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::validation(
                "Backoff multiplier must be at least 1.0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::validation(
                "Max delay must be greater than or equal to initial delay",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based, after the first failure)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;
        if self.jitter && capped > 1 {
            let spread = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped - spread)
        } else {
            Duration::from_millis(capped)
        }
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay_ms: 25,
            backoff_multiplier: 2.0,
            max_delay_ms: 2_000,
            max_wait_ms: Some(30_000),
            jitter: true,
        }
    }
}

/// Builder for constructing CoordinationSettings instances with validation
#[derive(Debug, Clone)]
pub struct CoordinationSettingsBuilder {
    settings: CoordinationSettings,
}

impl CoordinationSettingsBuilder {
    /// Create a new builder seeded with defaults
    pub fn new() -> Self {
        Self {
            settings: CoordinationSettings::default(),
        }
    }

    pub fn heartbeat_interval_seconds(mut self, seconds: u64) -> Self {
        self.settings.heartbeat_interval_seconds = seconds;
        self
    }

    pub fn heartbeat_timeout_seconds(mut self, seconds: u64) -> Self {
        self.settings.heartbeat_timeout_seconds = seconds;
        self
    }

    pub fn clock_skew_tolerance_seconds(mut self, seconds: u64) -> Self {
        self.settings.clock_skew_tolerance_seconds = seconds;
        self
    }

    pub fn sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.settings.sweep_interval_seconds = seconds;
        self
    }

    pub fn sweep_lock_lease_seconds(mut self, seconds: u64) -> Self {
        self.settings.sweep_lock_lease_seconds = seconds;
        self
    }

    pub fn default_priority(mut self, priority: i64) -> Self {
        self.settings.default_priority = priority;
        self
    }

    pub fn max_pending_items(mut self, limit: usize) -> Self {
        self.settings.max_pending_items = Some(limit);
        self
    }

    pub fn default_lease_seconds(mut self, seconds: u64) -> Self {
        self.settings.default_lease_seconds = Some(seconds);
        self
    }

    pub fn lock_retry(mut self, policy: RetryPolicy) -> Self {
        self.settings.lock_retry = policy;
        self
    }

    pub fn claim_poll_interval_ms(mut self, millis: u64) -> Self {
        self.settings.claim_poll_interval_ms = millis;
        self
    }

    pub fn clarification_poll_interval_ms(mut self, millis: u64) -> Self {
        self.settings.clarification_poll_interval_ms = millis;
        self
    }

    pub fn clarification_default_answer<S: Into<String>>(mut self, answer: S) -> Self {
        self.settings.clarification_default_answer = answer.into();
        self
    }

    /// Build the CoordinationSettings instance
    pub fn build(self) -> Result<CoordinationSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for CoordinationSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

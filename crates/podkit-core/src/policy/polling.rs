//! Receipt polling schedule: capped exponential backoff plus a wall-clock deadline.
//!
//! ```text
//! delay(attempt) = min(interval * backoff_factor^attempt, max_interval)
//! timed out      = now - started_at >= timeout
//! ```
//!
//! Everything here is pure. Jitter lives in [`jittered`] and is never applied
//! by [`next_delay`], so the schedule stays reproducible in tests.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ConfigError;

pub const DEFAULT_INTERVAL_MS: u64 = 100;
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Validated polling configuration.
///
/// Fields are private: the only ways in are [`PollingConfig::new`],
/// [`PollingConfig::resolve`] and deserialization, all of which validate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PollingOverrides", into = "PollingOverrides")]
pub struct PollingConfig {
    interval_ms: u64,
    max_interval_ms: u64,
    backoff_factor: f64,
    timeout_ms: u64,
    max_attempts: Option<u32>,
}

/// Caller-supplied overrides; unset fields fall back to the defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// `Some(None)` (`null` in YAML) removes the attempt cap.
    #[serde(default, deserialize_with = "explicit_option", skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<Option<u32>>,
}

/// Present-but-null becomes `Some(None)`; an absent field stays `None` via `default`.
fn explicit_option<'de, D>(d: D) -> Result<Option<Option<u32>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<u32>::deserialize(d).map(Some)
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            max_interval_ms: DEFAULT_MAX_INTERVAL_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
        }
    }
}

impl PollingConfig {
    /// Build a config with no attempt cap, checking every invariant.
    pub fn new(
        interval_ms: u64,
        max_interval_ms: u64,
        backoff_factor: f64,
        timeout_ms: u64,
    ) -> Result<Self, ConfigError> {
        Self::resolve(PollingOverrides {
            interval_ms: Some(interval_ms),
            max_interval_ms: Some(max_interval_ms),
            backoff_factor: Some(backoff_factor),
            timeout_ms: Some(timeout_ms),
            max_attempts: None,
        })
    }

    /// Overlay `overrides` onto the defaults and validate the result.
    pub fn resolve(overrides: PollingOverrides) -> Result<Self, ConfigError> {
        Self::default().merged(overrides)
    }

    /// Overlay `overrides` onto `self`, producing a new validated config.
    pub fn merged(&self, overrides: PollingOverrides) -> Result<Self, ConfigError> {
        let config = Self {
            interval_ms: overrides.interval_ms.unwrap_or(self.interval_ms),
            max_interval_ms: overrides.max_interval_ms.unwrap_or(self.max_interval_ms),
            backoff_factor: overrides.backoff_factor.unwrap_or(self.backoff_factor),
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
        };
        config.validate()?;
        Ok(config)
    }

    /// Return a copy that gives up after `attempts` polls even before the deadline.
    pub fn with_max_attempts(self, attempts: u32) -> Result<Self, ConfigError> {
        self.merged(PollingOverrides {
            max_attempts: Some(Some(attempts)),
            ..Default::default()
        })
    }

    /// Return a copy bounded by the deadline alone.
    pub fn without_max_attempts(self) -> Self {
        Self {
            max_attempts: None,
            ..self
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("interval_ms", "must be greater than 0"));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_factor",
                format!("must be a finite value >= 1, got {}", self.backoff_factor),
            ));
        }
        if self.max_interval_ms < self.interval_ms {
            return Err(ConfigError::invalid(
                "max_interval_ms",
                format!(
                    "{} is below interval_ms {}",
                    self.max_interval_ms, self.interval_ms
                ),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("timeout_ms", "must be greater than 0"));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1 when set"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }
}

impl TryFrom<PollingOverrides> for PollingConfig {
    type Error = ConfigError;

    fn try_from(overrides: PollingOverrides) -> Result<Self, Self::Error> {
        Self::resolve(overrides)
    }
}

impl From<PollingConfig> for PollingOverrides {
    fn from(c: PollingConfig) -> Self {
        Self {
            interval_ms: Some(c.interval_ms),
            max_interval_ms: Some(c.max_interval_ms),
            backoff_factor: Some(c.backoff_factor),
            timeout_ms: Some(c.timeout_ms),
            max_attempts: Some(c.max_attempts),
        }
    }
}

/// `min(initial * factor^exponent, max)` in whole milliseconds.
pub(crate) fn capped_exponential(initial_ms: u64, factor: f64, max_ms: u64, exponent: u32) -> Duration {
    let exponent = exponent.min(i32::MAX as u32) as i32;
    let raw = initial_ms as f64 * factor.powi(exponent);
    let capped = raw.min(max_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Delay to sleep after the zero-based `attempt`-th poll came back empty.
pub fn next_delay(attempt: u32, config: &PollingConfig) -> Duration {
    capped_exponential(
        config.interval_ms,
        config.backoff_factor,
        config.max_interval_ms,
        attempt,
    )
}

/// `true` once `timeout` has elapsed since `started_at`.
pub fn has_timed_out(started_at: Instant, now: Instant, config: &PollingConfig) -> bool {
    now.saturating_duration_since(started_at) >= config.timeout()
}

/// Time left before the deadline, zero once it has passed.
pub fn remaining(started_at: Instant, now: Instant, config: &PollingConfig) -> Duration {
    config
        .timeout()
        .saturating_sub(now.saturating_duration_since(started_at))
}

/// Spread `delay` uniformly by ±`fraction` (0.1 = ±10%).
pub fn jittered(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let fraction = fraction.min(1.0);
    let factor = 1.0 + rand::thread_rng().gen_range(-fraction..=fraction);
    delay.mul_f64(factor)
}

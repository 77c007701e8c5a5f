//! Reconnect schedule for duplex connections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::polling::{capped_exponential, jittered};
use crate::error::ConfigError;

fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_attempts() -> Option<u32> {
    Some(10)
}

/// Exponential reconnect parameters.
///
/// `max_attempts: None` retries forever. `jitter` is a fraction (0.1 = ±10%)
/// and defaults to off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter: 0.0,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::invalid("initial_delay_ms", "must be greater than 0"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be a finite value >= 1, got {}", self.multiplier),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::invalid(
                "max_delay_ms",
                "must be at least initial_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid("jitter", "must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// What a connection does after its socket drops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Go straight to `Closed`.
    Never,
    ExponentialBackoff(ReconnectConfig),
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff(ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Never => Ok(()),
            Self::ExponentialBackoff(c) => c.validate(),
        }
    }

    /// Whether the 1-based reconnect `attempt` is allowed to run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            Self::Never => false,
            Self::ExponentialBackoff(c) => attempt >= 1 && c.max_attempts.map_or(true, |max| attempt <= max),
        }
    }

    /// Deterministic delay before the 1-based `attempt`; the first is `initial_delay`.
    pub fn base_delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::ExponentialBackoff(c) => Some(capped_exponential(
                c.initial_delay_ms,
                c.multiplier,
                c.max_delay_ms,
                attempt.saturating_sub(1),
            )),
        }
    }

    /// Delay before `attempt` with jitter applied, or `None` if the attempt is not allowed.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let base = self.base_delay(attempt)?;
        match self {
            Self::ExponentialBackoff(c) if c.jitter > 0.0 => Some(jittered(base, c.jitter)),
            _ => Some(base),
        }
    }
}

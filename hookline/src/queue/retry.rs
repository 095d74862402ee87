//! Exponential backoff with bounded jitter.
//!
//! Jitter is only ever added, and never exceeds `multiplier - 1` of the base
//! delay, so the delay for attempt `n + 1` is never shorter than the delay
//! for attempt `n`.

use std::time::Duration;

use rand::Rng;

use crate::config::Config;

/// Retry policy for failed jobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Leases a job may use before it is dead-lettered.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Growth factor per attempt, at least 1.0.
    pub multiplier: f64,

    /// Extra random delay as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(300), 2.0, 0.25)
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: f64,
    ) -> Self {
        let multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, multiplier - 1.0)
        } else {
            0.0
        };
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier,
            jitter,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_attempts,
            config.backoff_initial,
            config.backoff_max,
            config.backoff_multiplier,
            config.backoff_jitter,
        )
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Whether a job that has used `attempts` leases may be tried again.
    pub fn can_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    fn base_delay_secs(&self, attempts: u32) -> f64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        base.min(self.max_delay.as_secs_f64())
    }

    /// Delay before the next attempt, after `attempts` failed ones (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_delay_secs(attempts);
        let extra = if self.jitter > 0.0 && base > 0.0 {
            rand::thread_rng().gen_range(0.0..=base * self.jitter)
        } else {
            0.0
        };
        let capped = (base + extra).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }
}

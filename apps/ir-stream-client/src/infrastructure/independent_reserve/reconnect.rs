//! Reconnection Backoff
//!
//! Bounded exponential backoff with jitter for the feed connection. The
//! n-th consecutive failure waits `initial * multiplier^(n-1)`, capped at
//! `max_delay`, then jittered by `±jitter_factor` and clamped back into
//! `[1ms, max_delay]`. A successful connect resets the sequence.

use std::time::Duration;

use rand::Rng;

/// Backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Consecutive failures tolerated before giving up (0 = never give up).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Tracks consecutive failures and yields the next backoff delay.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    /// Create a policy with no failures recorded.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    ///
    /// Returns `None` once `max_attempts` consecutive failures have been
    /// recorded.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let base = self.base_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(self.jittered(base))
    }

    /// Forget past failures after a successful connect.
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Whether another retry is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    fn base_delay(&self, failures: u32) -> Duration {
        let max = self.config.max_delay.as_secs_f64();
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.max(1.0).powi(exponent);

        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.config.max_delay
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return base;
        }

        let spread = self.config.jitter_factor.min(1.0);
        let factor = rand::rng().random_range(1.0 - spread..=1.0 + spread);
        base.mul_f64(factor)
            .clamp(Duration::from_millis(1), self.config.max_delay.max(Duration::from_millis(1)))
    }
}

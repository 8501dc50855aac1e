//! Reconnection backoff.
//!
//! [`ReconnectPolicy`] describes the schedule and [`Backoff`] walks it. The
//! wait after the `n`th consecutive failure (zero-based) is
//! `initial_delay * growth^n`, capped at `max_delay`; a successful handshake
//! puts the counter back to zero. Jitter is off by default so the schedule
//! never decreases.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// Reconnection schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure; never below 1.
    pub growth: f64,
    /// Scale each wait by a random factor in `[0.5, 1.5)`, still capped.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: ReconnectConfig::INITIAL_DELAY,
            max_delay: ReconnectConfig::MAX_DELAY,
            growth: ReconnectConfig::GROWTH_FACTOR,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = if growth.is_finite() { growth.max(1.0) } else { 1.0 };
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after `failures` consecutive failed attempts.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let mut secs = (self.initial_delay.as_secs_f64() * self.growth.powi(exponent)).min(cap);
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(cap);
        }
        // Near Duration::MAX the f64 can round past what Duration holds
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// Position in a [`ReconnectPolicy`] schedule for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Count a failed attempt and return the wait before the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// The session is up again; start over from `initial_delay`.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

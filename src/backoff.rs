//! Exponential backoff with optional jitter

use std::time::Duration;

use rand::Rng;

/// Shape of an exponential backoff schedule
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// First delay
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: u32,
    /// Fraction of each delay (0.0-1.0) that may be shaved off at random
    pub jitter: f64,
}

impl BackoffPolicy {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2,
            jitter: 0.0,
        }
    }

    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Reconnect schedule for a dropped RPC connection
    pub const fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.2)
    }

    /// Escalating schedule for rejected RPC credentials
    pub const fn auth() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(600)).with_jitter(0.1)
    }

    /// Schedule for retrying a single delivery
    pub const fn delivery() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5)).with_jitter(0.2)
    }

    /// Schedule for restarting an adapter that failed to start
    pub const fn restart() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    /// Un-jittered delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt.min(32));
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Stateful iterator over a [`BackoffPolicy`]
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        base.mul_f64(1.0 - shave)
    }

    /// Number of delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ABOUTME: Retry delays for the bridge's transport calls: message sends, room subscriptions, room creation.
// ABOUTME: The delay after N consecutive failures grows geometrically up to a cap; a retry limit is optional.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: u32,
    /// Consecutive failures tolerated before giving up (0 = unlimited)
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_retries: 0,
        }
    }
}

impl BackoffConfig {
    /// Between attempts to post one message. Short, since the agent keeps producing output.
    pub fn sends() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Re-establishing a room subscription; `attempts` consecutive failures end the bridge
    pub fn subscriptions(attempts: u32) -> Self {
        Self::default().with_max_retries(attempts)
    }

    /// Same delays, giving up after `retries` consecutive failures
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Fixed short delays, for tests
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1,
            max_retries: 0,
        }
    }

    /// Delay to wait after `failures` consecutive failures (`failures >= 1`)
    pub fn delay_after(&self, failures: u32) -> Duration {
        let growth = self
            .multiplier
            .max(1)
            .checked_pow(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(growth).min(self.max_delay)
    }

    fn exhausted(&self, failures: u32) -> bool {
        self.max_retries > 0 && failures > self.max_retries
    }
}

/// Consecutive-failure counter for one retry loop
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Delay before the next retry, or None once retries are exhausted
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.config.exhausted(self.consecutive_failures) {
            return None;
        }
        Some(self.config.delay_after(self.consecutive_failures))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

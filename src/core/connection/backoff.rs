// src/core/connection/backoff.rs

//! Reconnect pacing: exponential backoff with jitter.

use crate::config::ReconnectConfig;
use rand::Rng;
use std::time::Duration;

/// No reconnect delay is ever shorter than this, whatever the configuration says.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// How the worker paces its reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    /// Consecutive failed attempts after which the worker gives up. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: MIN_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            max_attempts: 0,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            max_jitter: config.max_jitter,
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// The first delay, clamped to `MIN_RECONNECT_DELAY`.
    pub fn floor(&self) -> Duration {
        self.initial_delay.max(MIN_RECONNECT_DELAY)
    }

    /// The largest delay before jitter. Never below the floor.
    pub fn ceiling(&self) -> Duration {
        self.max_delay.max(self.floor())
    }

    pub fn is_exhausted(&self, failed_attempts: u32) -> bool {
        self.max_attempts != 0 && failed_attempts >= self.max_attempts
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}

/// The running backoff state of one connection worker.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
    failed_attempts: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.floor();
        Self {
            policy,
            current,
            failed_attempts: 0,
        }
    }

    /// Returns the delay to wait now (base plus jitter) and doubles the base
    /// for the next call, up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.policy.ceiling());
        base + self.policy.jitter()
    }

    /// The base of the next delay, without jitter.
    pub fn current_base(&self) -> Duration {
        self.current
    }

    /// Counts a failed connection attempt and returns the running total.
    pub fn record_failure(&mut self) -> u32 {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.failed_attempts
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.policy.is_exhausted(self.failed_attempts)
    }

    /// Back to the floor after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.policy.floor();
        self.failed_attempts = 0;
    }
}

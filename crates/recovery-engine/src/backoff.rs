//! Capped exponential backoff

use std::time::Duration;
use warden_core::RestartPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            current: base,
        }
    }

    pub fn from_policy(policy: &RestartPolicy) -> Self {
        Self::new(policy.base_backoff, policy.max_backoff)
    }

    /// Delay the next restart will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Take the current delay and double it for next time, up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .map_or(self.max, |doubled| doubled.min(self.max));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn is_reset(&self) -> bool {
        self.current == self.base
    }
}

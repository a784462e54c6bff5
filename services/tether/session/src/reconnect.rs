//! Reconnect attempt accounting with exponential backoff

use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters shared by all sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Fresh counter bound to this policy
    pub fn counter(&self) -> ReconnectCounter {
        ReconnectCounter {
            policy: *self,
            attempts: 0,
        }
    }
}

/// Attempt count for one session key, owned by its actor
#[derive(Debug, Clone)]
pub struct ReconnectCounter {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ReconnectCounter {
    /// Record a failed connection; returns the new count
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= self.policy.max_attempts {
            warn!(
                "Reconnect budget used up ({}/{})",
                self.attempts, self.policy.max_attempts
            );
        } else {
            debug!(
                "Recorded failure (count: {}/{})",
                self.attempts, self.policy.max_attempts
            );
        }
        self.attempts
    }

    /// Record a successful connection
    pub fn record_success(&mut self) {
        self.attempts = 0;
    }

    /// Whether another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.attempts < self.policy.max_attempts
    }

    /// Current count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay after a counted failure
    pub fn next_delay(&self) -> Duration {
        self.policy.next_delay(self.attempts)
    }

    /// Delay after a failure that did not count, e.g. an unreachable proxy
    pub fn uncounted_delay(&self) -> Duration {
        self.policy.next_delay(self.attempts.max(1))
    }

    /// Policy this counter follows
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

//! Retry policy for hook handlers.
//!
//! Stateless: the engine asks the policy whether another attempt is allowed
//! and how long to back off before it.

use std::time::Duration;

use conductor_types::config::HookEngineConfig;

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            retries,
            base_backoff,
            max_backoff,
        }
    }

    /// Policy for a hook with `retries` using the engine's backoff settings.
    pub fn from_config(retries: u32, config: &HookEngineConfig) -> Self {
        Self::new(
            retries,
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Whether a retry may follow the failed `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.retries
    }

    /// Delay before the attempt that follows `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms).min(self.max_backoff)
    }
}

use std::time::Duration;

use cadence_core::config::RetryConfig;

/// Bounded retry with exponential backoff: base, 2×base, 4×base … capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The failure that brings `retry_count` to this value is final.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    /// Whether a job that has now failed `retry_count` times gets another go.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before attempt number `retry_count + 1`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        // 2^(n-1), clamped so the shift cannot overflow
        let exponent = retry_count.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(
            cfg.max_retries,
            Duration::from_secs(cfg.base_backoff_secs),
            Duration::from_secs(cfg.max_backoff_secs),
        )
    }
}

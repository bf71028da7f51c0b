//! Exponential reconnect backoff.

use std::time::Duration;

use tambourine_core::config::ConnectionConfig;

/// `delay(n) = min(base * 2^n, max)`, saturating instead of overflowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl From<&ConnectionConfig> for Backoff {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
        }
    }
}

impl Backoff {
    /// Delay before the retry that follows `retry_count` earlier retries.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let ms = 2u64
            .checked_pow(retry_count)
            .and_then(|factor| self.base_ms.checked_mul(factor))
            .map_or(self.max_ms, |ms| ms.min(self.max_ms));
        Duration::from_millis(ms)
    }
}

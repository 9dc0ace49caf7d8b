use std::time::Duration;

use crate::config::ExchangeSettings;

/// Exponential backoff: `base × 2^(attempt-1)`, capped at `max_delay`.
///
/// `max_attempts = None` retries forever (candle feed); the exchange adapter
/// always runs with a bound.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn bounded(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub fn unlimited(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self::bounded(
            Duration::from_millis(settings.retry_base_delay_ms),
            Duration::from_millis(settings.retry_max_delay_ms),
            settings.retry_max_attempts,
        )
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(Duration::from_millis(500), Duration::from_secs(30), 5)
    }
}

//! Exponential backoff policy

use crate::config::HealthSettings;
use std::time::Duration;

/// Doubling backoff with an upper bound
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        Self {
            initial: settings.initial_backoff(),
            max: settings.max_backoff(),
            ..Self::default()
        }
    }

    /// Delay to wait after `failures` consecutive failures (0 means no delay)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(16);
        let millis = (self.initial.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.max)
    }
}

//! Delivery retry policy for messages without a known route

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often and how late an unroutable message is re-attempted
///
/// The default performs a single retry one second after route discovery
/// started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Re-attempts after the first routing miss
    pub max_attempts: u32,
    /// Delay before the first re-attempt
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never re-attempts
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Whether re-attempt number `attempt` (1-based) may run
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Delay before re-attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_ms = (self.initial_delay_ms as f64 * multiplier).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

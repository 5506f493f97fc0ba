//! Exponential reconnect backoff with uniform jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::HealthConfig;

/// Stateless backoff: computes a delay from the current attempt count.
///
/// `delay(n) = min(base * 2^n + jitter, max)` with `jitter` uniform in
/// `[0, max_jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_jitter: Duration) -> Self {
        Self {
            base,
            max,
            max_jitter,
        }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(
            config.base_reconnect_delay,
            config.max_reconnect_delay,
            config.max_jitter,
        )
    }

    /// Delay before the next attempt, given `attempts` failures so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        let max_jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter_ms = if max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter_ms)
        };
        self.delay_with_jitter(attempts, Duration::from_millis(jitter_ms))
    }

    /// Deterministic form of [`delay`](Self::delay) with the jitter supplied.
    pub fn delay_with_jitter(&self, attempts: u32, jitter: Duration) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let exp_ms = base_ms.saturating_mul(factor);
        let total_ms = exp_ms.saturating_add(jitter.as_millis() as u64);
        Duration::from_millis(total_ms).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

//! Reconnect budget with backoff and cooldown
//!
//! The policy does not read the clock; callers pass `now` so the behaviour
//! is deterministic under test.

use std::time::{Duration, Instant};

use crate::config::{BackoffKind, ReconnectConfig};

/// Delay for a 1-based attempt number, capped at `max_delay`
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let delay = match config.backoff {
        BackoffKind::Linear => config.base_delay.saturating_mul(attempt),
        BackoffKind::Exponential => {
            // Prevent overflow of the shift
            let shift = attempt.saturating_sub(1).min(30);
            config.base_delay.saturating_mul(1u32 << shift)
        }
    };

    delay.min(config.max_delay)
}

/// Attempt counter and last attempt time
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_attempt: None,
        }
    }

    /// Attempts charged in the current window
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Forget all attempts (called on every successful open)
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    /// Reserve the next attempt, charging `weight` against the budget
    ///
    /// Returns the delay to wait before reconnecting, or `None` when the
    /// budget is exhausted and the cooldown has not yet elapsed.
    pub fn next_delay(&mut self, now: Instant, weight: u32) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }

        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) >= self.config.cooldown {
                self.attempts = 0;
            }
        }

        if self.attempts >= self.config.max_attempts {
            return None;
        }

        self.attempts = self
            .attempts
            .saturating_add(weight.max(1))
            .min(self.config.max_attempts);
        self.last_attempt = Some(now);

        Some(backoff_delay(&self.config, self.attempts))
    }
}

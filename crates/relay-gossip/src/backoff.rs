//! Reconnect delays for the bridge's source stream.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
///
/// The undithered delay starts at `initial_delay_ms`, grows by `multiplier`
/// per failure and is capped at `max_delay_ms`. Jitter spreads each delay
/// by up to `jitter` of its value in either direction, never past the cap.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Forget past failures. Called once the stream delivers again.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next reconnect, without jitter.
    pub fn base_delay(&self) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let exp = self.attempts.min(32) as i32;
        let delay = (initial * self.config.multiplier.powi(exp)).min(max);
        Duration::from_millis(delay as u64)
    }

    /// Record a failure and return how long to wait before reconnecting.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay().as_millis() as f64;
        self.attempts = self.attempts.saturating_add(1);

        let spread = base * self.config.jitter;
        let jittered = if spread > 0.0 {
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };
        let capped = jittered.clamp(0.0, self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

//! Exponential backoff with jitter.

use std::time::Duration;

/// Retry delay state for one channel.
///
/// `attempt` counts failures since the last success. Delays grow
/// geometrically from `base_delay`, are capped at `max_delay` and then
/// perturbed by up to `jitter_fraction` in either direction.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_fraction: f64,
}

impl RetryBackoff {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_fraction: f64,
    ) -> Self {
        Self {
            attempt: 0,
            base_delay,
            max_delay,
            multiplier,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    /// Delay owed before the next attempt. Zero after a success.
    pub fn next_delay(&self) -> Duration {
        let capped = self.capped_delay_secs();
        if capped == 0.0 || self.jitter_fraction == 0.0 {
            return Duration::from_secs_f64(capped);
        }

        let perturbation = (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_fraction;
        Duration::from_secs_f64((capped * (1.0 + perturbation)).max(0.0))
    }

    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.attempt = 0;
    }

    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.attempt < max_attempts
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `min(base * multiplier^(attempt-1), max)` in seconds, before jitter.
    fn capped_delay_secs(&self) -> f64 {
        if self.attempt == 0 {
            return 0.0;
        }
        let exponent = (self.attempt - 1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to inf for long failure streaks; min() keeps the cap.
        raw.min(self.max_delay.as_secs_f64())
    }
}

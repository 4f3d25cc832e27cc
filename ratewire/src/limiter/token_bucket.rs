//! Token bucket rate budget.
//!
//! Permits refill continuously in proportion to elapsed clock time. The
//! refill is always recomputed from `last_refill_at`, never by fixed ticks, so
//! fractional rates below one permit per second do not drift.

use std::time::{Duration, Instant};

use crate::clock::SharedClock;

/// A refillable budget of send permits.
#[derive(Debug)]
pub struct RateBudget {
    /// Maximum permits (burst size).
    capacity: f64,
    /// Permits added per second.
    refill_rate: f64,
    /// Current permits, always within `0..=capacity`.
    available: f64,
    /// Last refill time.
    last_refill_at: Instant,
    clock: SharedClock,
}

impl RateBudget {
    /// Create a full budget.
    ///
    /// Callers validate that `capacity` and `refill_rate` are positive; see
    /// [`ChannelConfig::validate`](crate::config::ChannelConfig::validate).
    pub fn new(capacity: f64, refill_rate: f64, clock: SharedClock) -> Self {
        Self::with_available(capacity, refill_rate, capacity, clock)
    }

    /// Create a budget starting with `available` permits (clamped to `0..=capacity`).
    ///
    /// `capacity` is floored at one permit, otherwise a bucket sized for a
    /// sub-1/s rate could never hold a whole permit.
    pub fn with_available(
        capacity: f64,
        refill_rate: f64,
        available: f64,
        clock: SharedClock,
    ) -> Self {
        let capacity = capacity.max(1.0);
        let last_refill_at = clock.now();
        Self {
            capacity,
            refill_rate,
            available: available.clamp(0.0, capacity),
            last_refill_at,
            clock,
        }
    }

    /// Try to take `n` permits.
    ///
    /// Returns `false` without side effects when not enough permits are available.
    pub fn consume(&mut self, n: f64) -> bool {
        self.refill();

        if self.available >= n {
            self.available -= n;
            true
        } else {
            false
        }
    }

    /// Time until `n` permits are available; zero if they already are.
    pub fn wait_time(&mut self, n: f64) -> Duration {
        self.refill();

        if self.available >= n {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((n - self.available) / self.refill_rate)
        }
    }

    /// Current permits, for observability.
    pub fn available_now(&mut self) -> f64 {
        self.refill();
        self.available
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        let new_permits = elapsed.as_secs_f64() * self.refill_rate;

        self.available = (self.available + new_permits).min(self.capacity);
        self.last_refill_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn manual() -> (Arc<ManualClock>, SharedClock) {
        let clock = Arc::new(ManualClock::new());
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    #[test]
    fn test_consume_until_empty() {
        let (_clock, shared) = manual();
        let mut budget = RateBudget::new(3.0, 1.0, shared);

        assert!(budget.consume(1.0));
        assert!(budget.consume(1.0));
        assert!(budget.consume(1.0));
        assert!(!budget.consume(1.0));
        assert_eq!(budget.available_now(), 0.0);
    }

    #[test]
    fn test_failed_consume_has_no_side_effect() {
        let (_clock, shared) = manual();
        let mut budget = RateBudget::with_available(5.0, 1.0, 1.5, shared);

        assert!(!budget.consume(2.0));
        assert_eq!(budget.available_now(), 1.5);
    }

    #[test]
    fn test_refill_is_capped() {
        let (clock, shared) = manual();
        let mut budget = RateBudget::with_available(10.0, 5.0, 0.0, shared);

        clock.advance(Duration::from_secs(2));
        assert_eq!(budget.available_now(), 10.0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(budget.available_now(), 10.0);
    }

    #[test]
    fn test_fractional_rate_accumulates_without_drift() {
        let (clock, shared) = manual();
        let mut budget = RateBudget::with_available(1.0, 0.25, 0.0, shared);

        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            assert!(!budget.consume(1.0));
        }
        clock.advance(Duration::from_secs(1));
        assert!(budget.consume(1.0));
    }

    #[test]
    fn test_sub_one_capacity_still_grants() {
        let (clock, shared) = manual();
        let mut budget = RateBudget::new(0.5, 0.5, shared);

        assert!(budget.consume(1.0));
        assert!(!budget.consume(1.0));
        assert_eq!(budget.wait_time(1.0), Duration::from_secs(2));

        clock.advance(Duration::from_secs(2));
        assert!(budget.consume(1.0));

        clock.advance(Duration::from_secs(60));
        assert_eq!(budget.available_now(), 1.0);
    }

    #[test]
    fn test_wait_time() {
        let (clock, shared) = manual();
        let mut budget = RateBudget::with_available(2.0, 2.0, 0.0, shared);

        assert_eq!(budget.wait_time(1.0), Duration::from_millis(500));

        clock.advance(Duration::from_millis(500));
        assert_eq!(budget.wait_time(1.0), Duration::ZERO);
    }

    #[test]
    fn test_available_never_leaves_bounds() {
        let (clock, shared) = manual();
        let mut budget = RateBudget::new(4.0, 3.0, shared);

        for step in 0..200u64 {
            clock.advance(Duration::from_millis(step % 7 * 40));
            let _ = budget.consume((step % 3) as f64);
            let available = budget.available_now();
            assert!((0.0..=4.0).contains(&available));
        }
    }
}

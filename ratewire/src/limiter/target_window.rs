//! Per-target trailing-minute send counters.
//!
//! Some channels cap how often one recipient may be messaged, independently
//! of the channel-wide rate. Entries for targets with no recent sends are
//! removed so the map only holds active recipients.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::fixed_window::prune_window;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct TargetWindowLimiter {
    max_per_minute: u32,
    sent: HashMap<String, VecDeque<Instant>>,
}

impl TargetWindowLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            sent: HashMap::new(),
        }
    }

    /// Time until `target` may be sent to again; zero when it may be now.
    pub fn wait_time(&mut self, target: &str, now: Instant) -> Duration {
        let Some(window) = self.sent.get_mut(target) else {
            return Duration::ZERO;
        };
        prune_window(window, now, MINUTE);

        if window.len() < self.max_per_minute as usize {
            if window.is_empty() {
                self.sent.remove(target);
            }
            return Duration::ZERO;
        }
        window
            .front()
            .map_or(Duration::ZERO, |oldest| {
                (*oldest + MINUTE).saturating_duration_since(now)
            })
    }

    pub fn record(&mut self, target: &str, now: Instant) {
        self.sent
            .entry(target.to_string())
            .or_default()
            .push_back(now);
    }

    /// Targets with sends in the trailing minute.
    pub fn tracked_targets(&self) -> usize {
        self.sent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_per_target() {
        let start = Instant::now();
        let mut limiter = TargetWindowLimiter::new(2);

        limiter.record("alice", start);
        limiter.record("alice", start + Duration::from_secs(10));
        limiter.record("bob", start + Duration::from_secs(10));

        let now = start + Duration::from_secs(20);
        assert_eq!(limiter.wait_time("alice", now), Duration::from_secs(40));
        assert_eq!(limiter.wait_time("bob", now), Duration::ZERO);
        assert_eq!(limiter.wait_time("carol", now), Duration::ZERO);
    }

    #[test]
    fn test_expired_targets_are_forgotten() {
        let start = Instant::now();
        let mut limiter = TargetWindowLimiter::new(1);

        limiter.record("alice", start);
        assert!(!limiter.wait_time("alice", start).is_zero());
        assert_eq!(limiter.tracked_targets(), 1);

        assert!(limiter.wait_time("alice", start + MINUTE).is_zero());
        assert_eq!(limiter.tracked_targets(), 0);
    }
}

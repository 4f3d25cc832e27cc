//! Fixed-window send counters.
//!
//! Secondary limit kept alongside the token bucket: counts deliveries in the
//! trailing second and the trailing minute and blocks while either window is
//! at its cap.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_per_second: u32,
    max_per_minute: u32,
    sent_in_last_second: VecDeque<Instant>,
    sent_in_last_minute: VecDeque<Instant>,
}

impl FixedWindowLimiter {
    pub fn new(max_per_second: u32, max_per_minute: u32) -> Self {
        Self {
            max_per_second,
            max_per_minute,
            sent_in_last_second: VecDeque::new(),
            sent_in_last_minute: VecDeque::new(),
        }
    }

    /// Whether either window is at its cap at `now`. Prunes expired entries.
    pub fn is_blocked(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.sent_in_last_second.len() >= self.max_per_second as usize
            || self.sent_in_last_minute.len() >= self.max_per_minute as usize
    }

    /// Record a delivery made at `now`.
    pub fn record(&mut self, now: Instant) {
        self.sent_in_last_second.push_back(now);
        self.sent_in_last_minute.push_back(now);
    }

    /// `(sent in last second, sent in last minute)` at `now`.
    pub fn counts(&mut self, now: Instant) -> (usize, usize) {
        self.prune(now);
        (
            self.sent_in_last_second.len(),
            self.sent_in_last_minute.len(),
        )
    }

    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.sent_in_last_second, now, SECOND);
        prune_window(&mut self.sent_in_last_minute, now, MINUTE);
    }
}

pub(super) fn prune_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(&oldest) = window.front() {
        if now.saturating_duration_since(oldest) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_window_blocks_and_expires() {
        let start = Instant::now();
        let mut limiter = FixedWindowLimiter::new(2, 100);

        assert!(!limiter.is_blocked(start));
        limiter.record(start);
        limiter.record(start + Duration::from_millis(100));
        assert!(limiter.is_blocked(start + Duration::from_millis(200)));

        // The first entry is exactly one second old here.
        assert!(!limiter.is_blocked(start + Duration::from_secs(1)));
        assert_eq!(limiter.counts(start + Duration::from_secs(1)), (1, 2));
    }

    #[test]
    fn test_minute_window_blocks() {
        let start = Instant::now();
        let mut limiter = FixedWindowLimiter::new(100, 3);

        for i in 0..3 {
            limiter.record(start + Duration::from_secs(i * 10));
        }
        assert!(limiter.is_blocked(start + Duration::from_secs(30)));
        assert!(!limiter.is_blocked(start + Duration::from_secs(60)));
    }
}

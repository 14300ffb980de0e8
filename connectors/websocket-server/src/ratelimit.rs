//! A sliding-window per-connection message counter backing `rateLimit`:
//! timestamps older than the window are evicted before each admission check,
//! so no boundary straddling a fixed-window reset can ever admit more than
//! `max_messages` within any `window`-sized span.

use lens_core::config::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    max_messages: u32,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self { max_messages: config.max_messages, window: config.window(), timestamps: Mutex::new(VecDeque::new()) }
    }

    /// Returns `true` if the message is allowed, recording its timestamp;
    /// `false` once `max_messages` remain within the trailing `window`.
    pub fn allow(&self) -> bool {
        let mut timestamps = self.timestamps.lock().unwrap();
        let now = Instant::now();
        while let Some(oldest) = timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as u32 >= self.max_messages {
            return false;
        }
        timestamps.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_admits_as_entries_age_out() {
        let limiter = RateLimiter::new(&RateLimitConfig { max_messages: 2, window_ms: 50 });
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.allow());
    }

    #[test]
    fn window_boundary_never_admits_more_than_the_budget() {
        let limiter = RateLimiter::new(&RateLimitConfig { max_messages: 2, window_ms: 50 });
        assert!(limiter.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow());
        // Both timestamps are still within the last 50ms, straddling where a
        // fixed window would have reset and wrongly allowed two more.
        assert!(!limiter.allow());
    }
}

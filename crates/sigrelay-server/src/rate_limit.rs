//! Sliding-window rate limiter for upgrade attempts.
//!
//! Keeps a per-IP list of attempt timestamps that decay over a rolling
//! window. Bounds how fast a single address can open connections or probe
//! room ids.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with a per-key limit over a sliding window.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum attempts allowed within the window.
    max_attempts: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → attempt timestamps.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Upgrade attempts per minute per address.
    pub fn per_minute(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::from_secs(60))
    }

    /// Check if an attempt is allowed for the given key, and record it if so.
    ///
    /// Returns `true` if allowed, `false` if rate-limited. A limit of zero
    /// disables limiting.
    pub fn check_and_record(&mut self, key: IpAddr) -> bool {
        if self.max_attempts == 0 {
            return true;
        }
        let now = Instant::now();
        let window = self.window;

        let attempts = self.entries.entry(key).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }

        attempts.push(now);
        true
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.entries.len();

        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });

        before - self.entries.len()
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn limits_per_address() {
        let mut limiter = RateLimiter::per_minute(3);
        for _ in 0..3 {
            assert!(limiter.check_and_record(ip(1)));
        }
        assert!(!limiter.check_and_record(ip(1)));
        assert!(limiter.check_and_record(ip(2)));
    }

    #[test]
    fn zero_disables_limiting() {
        let mut limiter = RateLimiter::per_minute(0);
        for _ in 0..100 {
            assert!(limiter.check_and_record(ip(1)));
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn window_expiry_and_gc() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check_and_record(ip(1)));
        assert!(!limiter.check_and_record(ip(1)));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(limiter.gc(), 1);
        assert_eq!(limiter.tracked(), 0);
        assert!(limiter.check_and_record(ip(1)));
    }
}

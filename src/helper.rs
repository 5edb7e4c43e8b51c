//! Helper utilities for Sockstun
//!
//! Shared constants and small building blocks used by the transport and
//! connection layers.

use std::time::Duration;
use tokio::time::Instant;

/// Default buffer size for IO operations
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default upstream connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default name resolution timeout in milliseconds
pub const DEFAULT_RESOLVE_TIMEOUT_MS: u64 = 5_000;

/// Resolution timeout used when the configured value is zero
pub const UNBOUNDED_RESOLVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest amount of client data held while the upstream is not ready
pub const MAX_PENDING_BYTES: usize = 1024 * 1024 + 1024;

/// Parse duration from milliseconds
pub fn duration_from_millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Resolution timeout for a configured millisecond value; zero means 300 seconds
pub fn resolve_timeout(ms: u64) -> Duration {
    if ms == 0 {
        UNBOUNDED_RESOLVE_TIMEOUT
    } else {
        Duration::from_millis(ms)
    }
}

/// Fixed-window bytes-per-second budget
///
/// Once the budget for the current one-second window is spent, `delay` reports
/// how long the caller must wait before moving more data.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    window_start: Instant,
    used: u64,
}

impl RateLimiter {
    /// Create a limiter; `None` when `bytes_per_sec` is zero (unlimited)
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        if bytes_per_sec == 0 {
            return None;
        }
        Some(RateLimiter {
            bytes_per_sec,
            window_start: Instant::now(),
            used: 0,
        })
    }

    /// Configured rate
    pub fn rate(&self) -> u64 {
        self.bytes_per_sec
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.used = 0;
        }
    }

    /// Bytes that may still be moved in the current window
    pub fn remaining(&mut self) -> u64 {
        self.roll(Instant::now());
        self.bytes_per_sec.saturating_sub(self.used)
    }

    /// Time to wait before the next transfer, if the window is exhausted
    pub fn delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.roll(now);
        if self.used < self.bytes_per_sec {
            return None;
        }
        Some(
            (self.window_start + Duration::from_secs(1)).saturating_duration_since(now),
        )
    }

    /// Account for `n` transferred bytes
    pub fn consume(&mut self, n: usize) {
        self.roll(Instant::now());
        self.used = self.used.saturating_add(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BUFFER_SIZE, 8192);
        assert_eq!(DEFAULT_CONNECT_TIMEOUT_MS, 10_000);
        assert_eq!(DEFAULT_RESOLVE_TIMEOUT_MS, 5_000);
        assert_eq!(MAX_PENDING_BYTES, 1_049_600);
    }

    #[test]
    fn test_resolve_timeout() {
        assert_eq!(resolve_timeout(0), Duration::from_secs(300));
        assert_eq!(resolve_timeout(5000), Duration::from_secs(5));
    }

    #[test]
    fn test_duration_from_millis() {
        assert_eq!(duration_from_millis(1500), Duration::from_millis(1500));
        assert_eq!(duration_from_millis(0), Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter_unlimited() {
        assert!(RateLimiter::new(0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(1000).unwrap();
        assert_eq!(limiter.rate(), 1000);
        assert!(limiter.delay().is_none());

        limiter.consume(600);
        assert_eq!(limiter.remaining(), 400);
        assert!(limiter.delay().is_none());

        limiter.consume(400);
        let wait = limiter.delay().unwrap();
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.delay().is_none());
        assert_eq!(limiter.remaining(), 1000);
    }
}

//! Fixed-window per-subject rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anzu_protocol::defaults::RATE_LIMIT_PER_MINUTE;

struct Window {
    started: Instant,
    count: u32,
}

/// Fixed one-minute windows per subject. Windows reset lazily on access.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RATE_LIMIT_PER_MINUTE, Duration::from_secs(60))
    }
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `subject`. Returns false when the budget for
    /// the current window is spent.
    pub fn allow(&self, subject: &str) -> bool {
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let bucket = buckets.entry(subject.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(bucket.started) >= self.window {
            bucket.started = now;
            bucket.count = 0;
        }

        if bucket.count >= self.limit {
            return false;
        }
        bucket.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exact_boundary() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow("alice"));
        assert!(limiter.allow("alice"));
        assert!(limiter.allow("alice"));
        assert!(!limiter.allow("alice"));
    }

    #[test]
    fn test_subjects_isolated() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("alice"));
        assert!(!limiter.allow("alice"));
        assert!(limiter.allow("bob"));
    }

    #[test]
    fn test_window_resets() {
        let limiter = RateLimiter::new(1, Duration::from_millis(0));
        assert!(limiter.allow("alice"));
        // Zero-length window: every call starts a fresh one.
        assert!(limiter.allow("alice"));
    }
}

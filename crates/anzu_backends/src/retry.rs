//! Retry manager with exponential backoff.
//!
//! `delay = min(base * 2^attempt, max_delay)`, plus a small jitter so
//! concurrent retries do not land in lockstep. Only errors classified
//! retryable are re-attempted; validation and integrity failures surface
//! immediately.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use anzu_protocol::defaults::{MAX_RETRIES, RETRY_BASE_SECS, RETRY_MAX_DELAY_SECS};

use crate::error::{BackendError, BackendResult};

/// Jitter cap added to each backoff delay (ms).
const RETRY_JITTER_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_secs(RETRY_BASE_SECS),
            max_delay: Duration::from_secs(RETRY_MAX_DELAY_SECS),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        exp + Duration::from_millis(jitter_ms())
    }

    /// Run `operation`, retrying retryable failures up to `max_retries`
    /// times. The last error is returned once retries exhaust.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = BackendResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation_name,
                        attempt + 1,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn jitter_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % RETRY_JITTER_MS)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_retries: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: 8,
        };
        let strip = |d: Duration| Duration::from_secs(d.as_secs());
        assert_eq!(strip(policy.delay_for(0)), Duration::from_secs(1));
        assert_eq!(strip(policy.delay_for(1)), Duration::from_secs(2));
        assert_eq!(strip(policy.delay_for(5)), Duration::from_secs(32));
        // 2^7 = 128 caps at 60.
        assert_eq!(strip(policy.delay_for(7)), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = quick_policy()
            .run("poll_status", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(BackendError::Busy("still busy".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_never_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: BackendResult<()> = quick_policy()
            .run("submit", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BackendError::Validation("bad workflow".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: BackendResult<()> = quick_policy()
            .run("free_memory", move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BackendError::Busy("wedged".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(BackendError::Busy(_))));
        // 1 initial + 3 retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}

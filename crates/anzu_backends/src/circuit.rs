//! Three-state circuit breaker guarding each external adapter.
//!
//! closed --(failures >= threshold)--> open
//! open --(recovery timeout elapsed)--> half_open
//! half_open --success--> closed, --failure--> open
//!
//! Open-state calls fail immediately with `BackendError::CircuitOpen`;
//! callers treat that as a transient resource-exhaustion condition.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use anzu_protocol::defaults::{CIRCUIT_BREAKER_THRESHOLD, CIRCUIT_RECOVERY_SECS};

use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Snapshot for `/gpu/status` and adapter metrics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub threshold: u32,
}

pub struct CircuitBreaker {
    service: String,
    threshold: u32,
    recovery: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_settings(
            service,
            CIRCUIT_BREAKER_THRESHOLD,
            Duration::from_secs(CIRCUIT_RECOVERY_SECS),
        )
    }

    pub fn with_settings(service: impl Into<String>, threshold: u32, recovery: Duration) -> Self {
        CircuitBreaker {
            service: service.into(),
            threshold: threshold.max(1),
            recovery,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// Admit or refuse a call. Moves open -> half_open once the recovery
    /// timeout has elapsed.
    pub fn check(&self) -> BackendResult<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery {
                    info!("{} breaker: open -> half_open (probing)", self.service);
                    inner.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(BackendError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            info!("{} breaker: half_open -> closed", self.service);
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!("{} breaker: probe failed, half_open -> open", self.service);
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.threshold {
                    warn!(
                        "{} breaker: {} consecutive failures, closed -> open",
                        self.service, inner.failure_count
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Run `operation` under the breaker. Validation failures pass through
    /// without counting against service health.
    pub async fn call<T, F, Fut>(&self, operation: F) -> BackendResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = BackendResult<T>>,
    {
        self.check()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if !matches!(e.kind(), anzu_protocol::ErrorKind::Validation) {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.threshold,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> BackendResult<()> {
        Err(BackendError::Busy("queue full".into()))
    }

    #[test]
    fn test_opens_at_threshold_not_before() {
        let breaker = CircuitBreaker::with_settings("image", 5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.check(),
            Err(BackendError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_half_open_after_recovery_then_closes_on_success() {
        let breaker = CircuitBreaker::with_settings("image", 1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Zero recovery: next check transitions to half-open and admits.
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_settings("image", 1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_call_counts_failures_and_success_resets() {
        let breaker = CircuitBreaker::with_settings("image", 2, Duration::from_secs(60));
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.snapshot().failure_count, 1);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_validation_errors_do_not_trip_breaker() {
        let breaker = CircuitBreaker::with_settings("llm", 1, Duration::from_secs(60));
        let _ = breaker
            .call(|| async {
                Err::<(), _>(BackendError::Validation("empty prompt".into()))
            })
            .await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}

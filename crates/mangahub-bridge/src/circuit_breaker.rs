//! Three-state circuit breaker.
//!
//! `threshold` consecutive failures open the circuit. While open, calls are
//! rejected with [`CircuitBreakerError::Open`] without running the
//! operation. Once `timeout` has elapsed since the last failure the next
//! call is let through in half-open state; two successes close the circuit
//! again and any failure reopens it.
//!
//! The lock is never held while the wrapped operation runs.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::CIRCUIT_REJECTIONS_TOTAL;

/// Successes needed in half-open state to close the circuit.
const HALF_OPEN_SUCCESSES: u32 = 2;

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls run normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls run; the outcome decides the next state.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a guarded call that did not succeed.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not run.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Guards calls to one family of fallible operations.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker. A zero threshold is raised to 1.
    pub fn new(name: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Run a synchronous operation through the breaker.
    pub fn call<T, E>(
        &self,
        operation: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, CircuitBreakerError<E>> {
        self.admit()?;
        let result = operation();
        self.record(result.is_ok());
        result.map_err(CircuitBreakerError::Operation)
    }

    /// Run an async operation through the breaker.
    pub async fn call_async<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let result = operation().await;
        self.record(result.is_ok());
        result.map_err(CircuitBreakerError::Operation)
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted in the current state.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Half-open successes counted so far.
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }

    fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let expired = inner
            .last_failure
            .is_none_or(|at| at.elapsed() > self.timeout);
        if expired {
            inner.state = CircuitState::HalfOpen;
            inner.failure_count = 0;
            inner.success_count = 0;
            info!(breaker = %self.name, "circuit breaker half-open");
            Ok(())
        } else {
            counter!(CIRCUIT_REJECTIONS_TOTAL, "breaker" => self.name.clone()).increment(1);
            Err(CircuitBreakerError::Open)
        }
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, success) {
            (CircuitState::Closed, true) => inner.failure_count = 0,
            (CircuitState::Closed, false) => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failure_count >= self.threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        timeout_ms = self.timeout.as_millis(),
                        "circuit breaker opened"
                    );
                }
            }
            (CircuitState::HalfOpen, true) => {
                inner.success_count += 1;
                if inner.success_count >= HALF_OPEN_SUCCESSES {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            (CircuitState::HalfOpen, false) => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.success_count = 0;
                inner.last_failure = Some(Instant::now());
                warn!(breaker = %self.name, "circuit breaker reopened from half-open");
            }
            // Admitted before another caller opened the circuit.
            (CircuitState::Open, false) => inner.last_failure = Some(Instant::now()),
            (CircuitState::Open, true) => {}
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::cell::Cell;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_millis(100))
    }

    fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| Err("boom"))
    }

    fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| Ok(()))
    }

    #[test]
    fn starts_closed() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker();
        for _ in 0..2 {
            assert_matches!(fail(&cb), Err(CircuitBreakerError::Operation("boom")));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert_matches!(fail(&cb), Err(CircuitBreakerError::Operation("boom")));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_without_running() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        let ran = Cell::new(false);
        let result: Result<(), CircuitBreakerError<&str>> = cb.call(|| {
            ran.set(true);
            Ok(())
        });
        assert!(result.unwrap_err().is_open());
        assert!(!ran.get());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker();
        let _ = fail(&cb);
        let _ = fail(&cb);
        succeed(&cb).unwrap();
        assert_eq!(cb.failure_count(), 0);
        let _ = fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_two_successes() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        succeed(&cb).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 1);

        succeed(&cb).unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.success_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        assert_matches!(fail(&cb), Err(CircuitBreakerError::Operation(_)));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(fail(&cb).unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_timeout() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(succeed(&cb).unwrap_err().is_open());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_async_runs_future() {
        let cb = breaker();
        let value = cb
            .call_async(|| async { Ok::<_, std::io::Error>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        for _ in 0..3 {
            let _ = cb
                .call_async(|| async { Err::<(), _>(std::io::Error::other("down")) })
                .await;
        }
        let err = cb.call_async(|| async { Ok::<_, std::io::Error>(1) }).await;
        assert!(err.unwrap_err().is_open());
    }

    #[test]
    fn reset_forces_closed() {
        let cb = breaker();
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        succeed(&cb).unwrap();
    }

    #[test]
    fn error_display() {
        let open: CircuitBreakerError<std::io::Error> = CircuitBreakerError::Open;
        assert_eq!(open.to_string(), "circuit breaker is open");
        let op: CircuitBreakerError<std::io::Error> =
            CircuitBreakerError::Operation(std::io::Error::other("down"));
        assert_eq!(op.to_string(), "down");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}

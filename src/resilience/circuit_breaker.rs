// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-store circuit breaker.
//!
//! Protects the service from hammering a store that is already failing.
//! Every adapter call asks [`CircuitBreaker::should_allow_request`] first and
//! reports the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`].
//!
//! States:
//! - Closed: normal operation, requests pass through
//! - Open: store unhealthy, requests fail fast without being attempted
//! - HalfOpen: recovery timeout elapsed, the next request probes the store
//!
//! Transitions:
//! - Closed -> Open once `failure_count >= failure_threshold`
//! - Open -> HalfOpen on the first request strictly after `recovery_timeout`
//! - HalfOpen -> Closed on the next success, HalfOpen -> Open on the next failure

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// How long to stay open before probing (half-open)
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Trips faster, waits the full minute before probing
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures and probes sooner
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let name = name.into();
        crate::metrics::set_circuit_state(&name, CircuitState::Closed);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current state, without advancing Open -> HalfOpen.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted since the last success.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Ask whether a call may go to the store.
    ///
    /// An open breaker whose recovery timeout has strictly elapsed moves to
    /// half-open and lets the call through. A rejection is counted but does
    /// not touch the failure count.
    pub fn should_allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let allowed = match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(Duration::MAX, |at| at.elapsed());
                if elapsed > self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(circuit = %self.name, "Circuit breaker half-open, probing store");
                    crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);

        self.calls_total.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_breaker_call(&self.name, "rejected");
        }
        allowed
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_breaker_call(&self.name, "success");

        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            info!(circuit = %self.name, "Circuit breaker closed, store recovered");
            crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_breaker_call(&self.name, "failure");

        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                "Circuit breaker opened"
            );
            crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
        }
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs the operation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.should_allow_request() {
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(result) => {
                self.record_success();
                Ok(result)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Get total number of calls (including rejected ones)
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.calls_total();
        if total == 0 {
            return 0.0;
        }
        self.failures() as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.failure_count(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let cb = breaker(3, 60_000);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow_request());
        assert_eq!(cb.rejections(), 1);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = breaker(3, 60_000);

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_only_after_timeout_strictly_elapsed() {
        let cb = breaker(1, 1_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(!cb.should_allow_request());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.should_allow_request());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let cb = breaker(1, 10);
        cb.record_failure();
        tokio::time::advance(Duration::from_millis(11)).await;

        assert!(cb.should_allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(3, 10);
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(cb.should_allow_request());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow_request());
    }

    #[tokio::test]
    async fn test_rejected_call_never_runs() {
        let cb = breaker(1, 60_000);
        let _: Result<(), CircuitError<&str>> = cb.call(|| async { Err("down") }).await;

        let runs = AtomicUsize::new(0);
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(cb.calls_total(), 2);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let cb = breaker(100, 60_000);

        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("x") }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(2) }).await;
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("y") }).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.recovery_timeout > lenient.recovery_timeout);
    }
}

// ── Circuit Breaker ─────────────────────────────────────────────────────────
//
// After `failure_threshold` consecutive failures the circuit trips (OPEN) and
// every call fails fast until `recovery_timeout` has passed since the last
// failure. The next call then moves the breaker to HALF_OPEN and runs as a
// trial; at most `half_open_max_calls` trials are in flight at once. Once that
// many trials succeed the circuit closes; any trial failure reopens it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{CircuitBreakerError, CircuitBreakerOpenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Successful trials needed in HALF_OPEN before closing; also the number
    /// of trials admitted concurrently.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time copy of a breaker's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
}

impl CircuitBreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_successes: 0,
            half_open_in_flight: 0,
        }
    }
}

/// Decides which errors count against the breaker.
pub trait FailurePredicate<E> {
    fn is_failure(&self, error: &E) -> bool;
}

/// Every error counts as a failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyError;

impl<E> FailurePredicate<E> for AnyError {
    fn is_failure(&self, _error: &E) -> bool {
        true
    }
}

impl<E, F> FailurePredicate<E> for F
where
    F: Fn(&E) -> bool,
{
    fn is_failure(&self, error: &E) -> bool {
        self(error)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitBreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.lock().clone()
    }

    /// Run `operation` through the breaker; every error counts as a failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_when(operation, |_: &E| true).await
    }

    /// Like [`CircuitBreaker::call`], but only errors for which `is_failure`
    /// returns `true` affect the breaker; others pass straight through.
    pub async fn call_when<T, E, F, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = self.admit()?;
        match operation().await {
            Ok(value) => {
                admission.succeeded();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    admission.failed();
                }
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Wrap `operation` so every invocation goes through this breaker.
    pub fn protect<F>(self: &Arc<Self>, operation: F) -> Protected<F, AnyError> {
        self.protect_when(operation, AnyError)
    }

    pub fn protect_when<F, P>(self: &Arc<Self>, operation: F, is_failure: P) -> Protected<F, P> {
        Protected {
            breaker: Arc::clone(self),
            operation,
            is_failure,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open_error(&self, retry_in: Duration) -> CircuitBreakerOpenError {
        CircuitBreakerOpenError {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn admit(&self) -> Result<Admission<'_>, CircuitBreakerOpenError> {
        let mut inner = self.lock();
        let current = inner.state;
        match current {
            CircuitState::Closed => Ok(Admission::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed <= self.config.recovery_timeout {
                    return Err(self.open_error(self.config.recovery_timeout - elapsed));
                }
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 1;
                tracing::info!(
                    "circuit_breaker[{}]: OPEN -> HALF_OPEN (recovery window elapsed)",
                    self.name
                );
                Ok(Admission::new(self, true))
            }
            CircuitState::HalfOpen => {
                let budget = self.config.half_open_max_calls.max(1);
                if inner.half_open_in_flight + inner.half_open_successes >= budget {
                    return Err(self.open_error(Duration::ZERO));
                }
                inner.half_open_in_flight += 1;
                Ok(Admission::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        let current = inner.state;
        match current {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls.max(1) {
                    *inner = CircuitBreakerState {
                        last_failure_time: inner.last_failure_time,
                        ..CircuitBreakerState::closed()
                    };
                    tracing::info!("circuit_breaker[{}]: HALF_OPEN -> CLOSED (success)", self.name);
                }
            }
            // A late success from before the circuit tripped (or reopened) changes nothing.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Instant::now());

        let current = inner.state;
        match current {
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    "circuit_breaker[{}]: TRIPPED after {} consecutive failures, failing fast for {}s",
                    self.name,
                    inner.failure_count,
                    self.config.recovery_timeout.as_secs()
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                tracing::warn!("circuit_breaker[{}]: HALF_OPEN -> OPEN (trial failed)", self.name);
            }
            _ => {}
        }
    }

    fn on_abandon(&self) {
        let mut inner = self.lock();
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }
}

/// One admitted call. A trial that is dropped without an outcome (cancelled,
/// or ended with an error that does not count) gives its slot back.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandon();
        }
    }
}

/// An operation bound to a breaker; see [`CircuitBreaker::protect`].
pub struct Protected<F, P> {
    breaker: Arc<CircuitBreaker>,
    operation: F,
    is_failure: P,
}

impl<F, P> Protected<F, P> {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, CircuitBreakerError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FailurePredicate<E>,
    {
        self.breaker
            .call_when(|| (self.operation)(arg), |e: &E| self.is_failure.is_failure(e))
            .await
    }
}

//! Circuit breaker state machine guarding calls to failing dependencies.
//!
//! Semantics:
//! - `Closed`: calls pass through; consecutive failures accumulate and a
//!   single success clears the streak.
//! - `Open`: calls are rejected with a `retry_after` hint until
//!   `reset_timeout` elapses, then the breaker probes via `HalfOpen`.
//! - `HalfOpen`: at most `half_open_max_calls` trial calls are admitted;
//!   `success_threshold` successes close the circuit, any failure reopens it.
//!
//! The admission check and all counter updates run under a `tokio::sync::Mutex`
//! so two logical callers cannot interleave between "check state" and
//! "increment half-open counter".
//!
//! Callers can use the higher-order [`CircuitBreaker::run`] wrapper or the
//! explicit [`CircuitBreaker::try_enter`] / [`CircuitBreaker::record_outcome`]
//! pair when a closure is inconvenient.

use crate::clock::{Clock, MonotonicClock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod middleware;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode admitting a limited number of trial calls.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitConfigError {
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Success threshold must be > 0.
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold {
        /// Value provided by caller.
        provided: usize,
    },
    /// Reset timeout must be > 0.
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
    /// The half-open probe window must be able to reach the success threshold.
    #[error("half_open_max_calls ({half_open_max_calls}) must be >= success_threshold ({success_threshold})")]
    HalfOpenBelowSuccessThreshold {
        /// Probe limit provided by caller.
        half_open_max_calls: usize,
        /// Success threshold provided by caller.
        success_threshold: usize,
    },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    success_threshold: usize,
    reset_timeout: Duration,
    half_open_max_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        success_threshold: usize,
        reset_timeout: Duration,
        half_open_max_calls: usize,
    ) -> Result<Self, CircuitConfigError> {
        let cfg =
            Self { failure_threshold, success_threshold, reset_timeout, half_open_max_calls };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), CircuitConfigError> {
        if self.failure_threshold == 0 {
            return Err(CircuitConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(CircuitConfigError::InvalidSuccessThreshold { provided: 0 });
        }
        if self.reset_timeout == Duration::ZERO {
            return Err(CircuitConfigError::InvalidResetTimeout(self.reset_timeout));
        }
        if self.half_open_max_calls < self.success_threshold {
            return Err(CircuitConfigError::HalfOpenBelowSuccessThreshold {
                half_open_max_calls: self.half_open_max_calls,
                success_threshold: self.success_threshold,
            });
        }
        Ok(())
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Successes required in HalfOpen before closing.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Duration to stay Open before HalfOpen probes.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Maximum admissions while HalfOpen.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

/// Rejection returned when the circuit refuses admission.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CircuitBreakerError {
    /// Human-readable rejection message.
    pub message: String,
    /// State that produced the rejection (Open, or saturated HalfOpen).
    pub state: CircuitState,
    /// How long to wait before the breaker will probe again.
    pub retry_after: Duration,
}

impl CircuitBreakerError {
    /// Retry hint in seconds, suitable for a `Retry-After` header.
    pub fn retry_after_secs(&self) -> f64 {
        self.retry_after.as_secs_f64()
    }
}

/// Error returned by [`CircuitBreaker::run`]: either an admission rejection
/// or the caller's own error, unchanged.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker refused admission.
    Rejected(CircuitBreakerError),
    /// The protected operation itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rejected(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> BreakerError<E> {
    /// Check if this error is an admission rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// Borrow the rejection details if present.
    pub fn rejection(&self) -> Option<&CircuitBreakerError> {
        match self {
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Structured record of a single state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    /// State before the transition.
    pub from: CircuitState,
    /// State after the transition.
    pub to: CircuitState,
    /// Failure count at transition time (after any reset the transition performs).
    pub failure_count: usize,
    /// Success count at transition time.
    pub success_count: usize,
    /// Clock timestamp in milliseconds.
    pub timestamp_millis: u64,
}

/// Entry in the breaker's event history.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// The breaker changed state.
    StateChange(StateChange),
    /// A protected call succeeded.
    CallSuccess {
        /// State observed after recording the success.
        state: CircuitState,
        /// Clock timestamp in milliseconds.
        timestamp_millis: u64,
    },
    /// A protected call failed.
    CallFailure {
        /// State observed after recording the failure.
        state: CircuitState,
        /// Error text reported by the caller.
        error: String,
        /// Clock timestamp in milliseconds.
        timestamp_millis: u64,
    },
    /// The breaker refused admission.
    CallRejected {
        /// State that produced the rejection.
        state: CircuitState,
        /// Retry hint attached to the rejection.
        retry_after_millis: u64,
        /// Clock timestamp in milliseconds.
        timestamp_millis: u64,
    },
}

/// Aggregate call statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub last_success_millis: Option<u64>,
    pub last_failure_millis: Option<u64>,
    /// Ordered log of every transition since construction or `reset()`.
    pub state_changes: Vec<StateChange>,
}

/// Point-in-time view returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub config: ConfigView,
    pub stats: StatsView,
    /// Seconds until the Open breaker will probe, `None` unless Open.
    pub time_until_half_open: Option<f64>,
}

/// Config fields exposed in status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    /// Seconds.
    pub reset_timeout: f64,
}

/// Aggregate counters exposed in status snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct StatsView {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

/// Listener invoked on every transition as `(name, from, to)`.
pub type StateListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: usize,
    success_count: usize,
    half_open_calls: usize,
    last_failure_millis: Option<u64>,
    stats: CircuitBreakerStats,
    events: Vec<BreakerEvent>,
}

impl BreakerInner {
    fn fresh() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure_millis: None,
            stats: CircuitBreakerStats::default(),
            events: Vec::new(),
        }
    }
}

/// Circuit breaker guarding a protected call.
///
/// Share one instance per logical dependency (via `Arc` or the
/// [`crate::circuit_breaker_registry::CircuitBreakerRegistry`]) so all call
/// sites observe the same failure accounting.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateListener>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("on_state_change", &self.on_state_change.as_ref().map(|_| "<listener>"))
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker from a validated config.
    ///
    /// # Examples
    /// ```
    /// use backstop::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30), 2).unwrap();
    /// let breaker = CircuitBreaker::new("payments", config).unwrap();
    /// ```
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, CircuitConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::fresh()),
            clock: Arc::new(MonotonicClock::default()),
            on_state_change: None,
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Register a listener invoked on every state transition.
    ///
    /// Listener panics are caught and swallowed; they must never break the
    /// breaker itself.
    pub fn with_state_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(listener));
        self
    }

    /// Breaker identity, unique within a registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured thresholds and timeouts.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after lazily applying the Open→HalfOpen timeout.
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.check_reset(&mut inner);
        inner.state
    }

    /// Request admission for one protected call.
    ///
    /// Counts the attempt, lazily performs the Open→HalfOpen transition once
    /// `reset_timeout` has elapsed, and either admits the call or rejects it
    /// with a retry hint. Rejections never touch the failure count.
    pub async fn try_enter(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock().await;
        inner.stats.total_calls += 1;
        self.check_reset(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.half_open_calls < self.config.half_open_max_calls => {
                inner.half_open_calls += 1;
                Ok(())
            }
            _ => Err(self.reject(&mut inner)),
        }
    }

    /// Record the outcome of an admitted call.
    ///
    /// Must be paired with a successful [`try_enter`](Self::try_enter);
    /// [`run`](Self::run) does the pairing automatically.
    pub async fn record_outcome(&self, success: bool, error: Option<&str>) {
        let mut inner = self.inner.lock().await;
        if success {
            self.record_success(&mut inner);
        } else {
            self.record_failure(&mut inner, error.unwrap_or(""));
        }
    }

    /// Run an async operation under breaker protection.
    ///
    /// Pairs `try_enter` with `record_outcome` on every exit path. The
    /// operation's own error is re-surfaced unchanged as
    /// [`BreakerError::Inner`] after being recorded.
    ///
    /// # Errors
    /// [`BreakerError::Rejected`] when the circuit refuses admission.
    pub async fn run<T, E, Fut, Op>(&self, operation: Op) -> Result<T, BreakerError<E>>
    where
        E: fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        if let Err(rejection) = self.try_enter().await {
            return Err(BreakerError::Rejected(rejection));
        }
        match operation().await {
            Ok(value) => {
                self.record_outcome(true, None).await;
                Ok(value)
            }
            Err(e) => {
                self.record_outcome(false, Some(&e.to_string())).await;
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the circuit Open, bypassing thresholds (maintenance/testing).
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Open);
        inner.last_failure_millis = Some(self.clock.now_millis());
    }

    /// Force the circuit Closed, bypassing thresholds.
    pub async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Zero all counters, clear history, and return to Closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = BreakerInner::fresh();
    }

    /// Snapshot the breaker, re-evaluating the Open→HalfOpen timeout first so
    /// status reads are never stale.
    pub async fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock().await;
        self.check_reset(&mut inner);

        let time_until_half_open = match (inner.state, inner.last_failure_millis) {
            (CircuitState::Open, Some(last)) => {
                let remaining = self.remaining_timeout(last);
                Some(remaining.as_secs_f64())
            }
            _ => None,
        };

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            config: ConfigView {
                failure_threshold: self.config.failure_threshold,
                success_threshold: self.config.success_threshold,
                reset_timeout: self.config.reset_timeout.as_secs_f64(),
            },
            stats: StatsView {
                total_calls: inner.stats.total_calls,
                successful_calls: inner.stats.successful_calls,
                failed_calls: inner.stats.failed_calls,
                rejected_calls: inner.stats.rejected_calls,
            },
            time_until_half_open,
        }
    }

    /// The most recent `limit` events (transitions, outcomes, rejections).
    pub async fn event_history(&self, limit: usize) -> Vec<BreakerEvent> {
        let inner = self.inner.lock().await;
        let start = inner.events.len().saturating_sub(limit);
        inner.events[start..].to_vec()
    }

    fn check_reset(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(last) = inner.last_failure_millis {
            let elapsed = self.clock.now_millis().saturating_sub(last);
            if elapsed >= Self::millis(self.config.reset_timeout) {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn reject(&self, inner: &mut BreakerInner) -> CircuitBreakerError {
        inner.stats.rejected_calls += 1;
        let retry_after = inner
            .last_failure_millis
            .map(|last| self.remaining_timeout(last))
            .unwrap_or(Duration::ZERO);

        let now = self.clock.now_millis();
        inner.events.push(BreakerEvent::CallRejected {
            state: inner.state,
            retry_after_millis: Self::millis(retry_after),
            timestamp_millis: now,
        });
        tracing::debug!(
            name = %self.name,
            state = %inner.state,
            retry_after_ms = Self::millis(retry_after),
            "circuit breaker rejected call"
        );

        CircuitBreakerError {
            message: format!("circuit breaker '{}' is {}", self.name, inner.state),
            state: inner.state,
            retry_after,
        }
    }

    fn record_success(&self, inner: &mut BreakerInner) {
        let now = self.clock.now_millis();
        inner.stats.successful_calls += 1;
        inner.stats.last_success_millis = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }

        inner.events.push(BreakerEvent::CallSuccess { state: inner.state, timestamp_millis: now });
    }

    fn record_failure(&self, inner: &mut BreakerInner, error: &str) {
        let now = self.clock.now_millis();
        inner.stats.failed_calls += 1;
        inner.last_failure_millis = Some(now);
        inner.stats.last_failure_millis = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                // Any half-open failure reopens immediately, regardless of
                // prior successes in the probe window.
                self.transition(inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }

        inner.events.push(BreakerEvent::CallFailure {
            state: inner.state,
            error: error.to_string(),
            timestamp_millis: now,
        });
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::HalfOpen => {
                inner.half_open_calls = 0;
                inner.success_count = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }

        let change = StateChange {
            from,
            to,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            timestamp_millis: self.clock.now_millis(),
        };
        inner.stats.state_changes.push(change.clone());
        inner.events.push(BreakerEvent::StateChange(change));

        match to {
            CircuitState::Open => {
                tracing::warn!(name = %self.name, from = %from, "circuit breaker → open")
            }
            CircuitState::HalfOpen => {
                tracing::info!(name = %self.name, "circuit breaker → half-open")
            }
            CircuitState::Closed => {
                tracing::info!(name = %self.name, "circuit breaker → closed")
            }
        }

        if let Some(listener) = &self.on_state_change {
            let listener = Arc::clone(listener);
            // A panicking listener must never break the breaker.
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&self.name, from, to)));
        }
    }

    fn remaining_timeout(&self, last_failure_millis: u64) -> Duration {
        let elapsed = self.clock.now_millis().saturating_sub(last_failure_millis);
        Duration::from_millis(Self::millis(self.config.reset_timeout).saturating_sub(elapsed))
    }

    fn millis(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }
}

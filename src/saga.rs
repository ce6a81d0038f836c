//! Compensating-transaction saga orchestrator.
//!
//! A saga is an ordered list of steps, each pairing an async action with an
//! optional best-effort compensation. Steps run strictly in registration
//! order; when one fails (after exhausting its retry budget), compensations
//! for the already-completed steps run strictly in reverse completion order.
//! Callers inspect the returned [`SagaReport`] rather than catching errors:
//! step failures are converted into a `Compensated` / `CompensationFailed`
//! outcome, never re-raised.
//!
//! Semantics:
//! - `retries` counts total attempts; each attempt is bounded by `timeout`
//!   and a timed-out attempt counts as a failure.
//! - Backoff between attempts is `100ms * 2^attempt`, applied through the
//!   injected [`Sleeper`] so tests stay instant.
//! - Compensations get a single attempt each; one failing does not stop the
//!   sweep, it only downgrades the outcome to `CompensationFailed`.

use crate::sleeper::{Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub mod subscription;

/// Error type produced by user-supplied actions and compensations.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Key-value context threaded through every step of a saga.
///
/// Steps read what earlier steps wrote and return a patch that is merged in
/// after the step completes. Backed by a JSON map: a fixed vocabulary of
/// well-known keys plus open extension.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SagaContext(Map<String, Value>);

impl SagaContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Merge `patch` into this context; patch keys win on conflict.
    pub fn merge(&mut self, patch: SagaContext) {
        for (key, value) in patch.0 {
            self.0.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for SagaContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

type StepAction =
    Arc<dyn Fn(SagaContext) -> BoxFuture<'static, Result<SagaContext, StepError>> + Send + Sync>;
type StepCompensation =
    Arc<dyn Fn(SagaContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// One step of a saga: an action plus an optional compensation.
///
/// Immutable once added to an orchestrator. Defaults: 30s timeout, 3 attempts.
pub struct SagaStep {
    name: String,
    action: StepAction,
    compensate: Option<StepCompensation>,
    timeout: Duration,
    retries: usize,
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("compensate", &self.compensate.as_ref().map(|_| "<compensation>"))
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish()
    }
}

impl SagaStep {
    /// Create a step from an async action returning a context patch.
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SagaContext, StepError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(move |ctx| action(ctx).boxed()),
            compensate: None,
            timeout: Duration::from_secs(30),
            retries: 3,
        }
    }

    /// Attach a best-effort compensation (single attempt, no retry).
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx| compensate(ctx).boxed()));
        self
    }

    /// Per-attempt deadline; a timed-out attempt counts as a failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts (initial try + retries). Must be > 0 to ever run.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Error describing a step attempt that exceeded its deadline.
#[derive(Debug, Clone, thiserror::Error)]
#[error("step '{step}' timed out after {timeout:?}")]
pub struct StepTimeout {
    /// Step that missed its deadline.
    pub step: String,
    /// Per-attempt deadline that was exceeded.
    pub timeout: Duration,
}

/// Lifecycle state of one saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Final outcome reported to the caller of [`SagaOrchestrator::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaOutcome {
    /// Every step completed.
    Completed,
    /// A step failed and every compensation succeeded.
    Compensated,
    /// A step failed and at least one compensation also failed.
    CompensationFailed,
}

impl fmt::Display for SagaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaOutcome::Completed => write!(f, "COMPLETED"),
            SagaOutcome::Compensated => write!(f, "COMPENSATED"),
            SagaOutcome::CompensationFailed => write!(f, "COMPENSATION_FAILED"),
        }
    }
}

/// Execution record retained per invocation, keyed by `saga_id`.
///
/// Never evicted automatically; pruning is the caller's responsibility.
#[derive(Debug, Clone, Serialize)]
pub struct SagaExecution {
    pub saga_id: String,
    pub status: SagaStatus,
    pub steps_completed: Vec<String>,
    pub steps_compensated: Vec<String>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub started_at_epoch_millis: u64,
    pub completed_at_epoch_millis: Option<u64>,
    pub context: SagaContext,
}

/// Result of one `execute()` call.
#[derive(Debug, Clone, Serialize)]
pub struct SagaReport {
    pub status: SagaOutcome,
    pub saga_id: String,
    pub context: SagaContext,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub compensated_steps: Vec<String>,
}

/// Saga lifecycle event kinds, one per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaEventKind {
    SagaStarted,
    StepStarted,
    StepCompleted,
    SagaFailed,
    CompensationStarted,
    CompensationStepStarted,
    CompensationStepCompleted,
    CompensationStepFailed,
    CompensationCompleted,
    SagaCompleted,
}

/// Event broadcast to registered observers.
#[derive(Debug, Clone, Serialize)]
pub struct SagaEvent {
    pub kind: SagaEventKind,
    pub saga_id: String,
    pub step: Option<String>,
    pub error: Option<String>,
    pub timestamp_epoch_millis: u64,
}

/// Observer notified of every saga lifecycle event.
///
/// Observer panics are caught and swallowed; a misbehaving observer never
/// affects the saga. Synchronous observers simply return a ready future.
#[async_trait::async_trait]
pub trait SagaObserver: Send + Sync {
    async fn on_event(&self, event: &SagaEvent);
}

/// Generic ordered-step orchestrator with automatic reverse-order
/// compensation.
pub struct SagaOrchestrator {
    steps: Vec<SagaStep>,
    executions: Mutex<HashMap<String, SagaExecution>>,
    observers: Vec<Arc<dyn SagaObserver>>,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("steps", &self.steps)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl Default for SagaOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaOrchestrator {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            executions: Mutex::new(HashMap::new()),
            observers: Vec::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Append a step; order is significant and fixed once registered.
    pub fn add_step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Register an observer for lifecycle events.
    pub fn observe(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Override the sleeper used for retry backoff (tests use
    /// [`crate::sleeper::InstantSleeper`]).
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Names of the registered steps, in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run every step in order, compensating on failure.
    ///
    /// Always returns a report carrying a fresh unique `saga_id`; callers
    /// must inspect `status` rather than expect an error.
    pub async fn execute(&self, initial: SagaContext) -> SagaReport {
        let saga_id = new_saga_id();
        let mut ctx = initial;
        ctx.insert("saga_id", Value::String(saga_id.clone()));

        {
            let mut executions = self.executions.lock().expect("saga executions poisoned");
            executions.insert(
                saga_id.clone(),
                SagaExecution {
                    saga_id: saga_id.clone(),
                    status: SagaStatus::Running,
                    steps_completed: Vec::new(),
                    steps_compensated: Vec::new(),
                    current_step: None,
                    error: None,
                    started_at_epoch_millis: epoch_millis(),
                    completed_at_epoch_millis: None,
                    context: ctx.clone(),
                },
            );
        }

        self.emit(SagaEventKind::SagaStarted, &saga_id, None, None).await;

        let mut completed: Vec<&SagaStep> = Vec::new();

        for step in &self.steps {
            self.update_execution(&saga_id, |e| e.current_step = Some(step.name.clone()));
            self.emit(SagaEventKind::StepStarted, &saga_id, Some(&step.name), None).await;

            match self.execute_with_retry(step, &ctx).await {
                Ok(patch) => {
                    ctx.merge(patch);
                    completed.push(step);
                    self.update_execution(&saga_id, |e| {
                        e.steps_completed.push(step.name.clone());
                        e.context = ctx.clone();
                    });
                    self.emit(SagaEventKind::StepCompleted, &saga_id, Some(&step.name), None)
                        .await;
                }
                Err(e) => {
                    let error_text = e.to_string();
                    warn!(
                        saga_id = %saga_id,
                        step = %step.name,
                        error = %error_text,
                        "saga step failed, compensating"
                    );
                    self.update_execution(&saga_id, |e| {
                        e.status = SagaStatus::Failed;
                        e.error = Some(error_text.clone());
                    });
                    self.emit(
                        SagaEventKind::SagaFailed,
                        &saga_id,
                        Some(&step.name),
                        Some(&error_text),
                    )
                    .await;

                    let (all_compensated, compensated_steps) =
                        self.compensate(&saga_id, &completed, &ctx).await;

                    self.update_execution(&saga_id, |e| {
                        e.status = if all_compensated {
                            SagaStatus::Compensated
                        } else {
                            SagaStatus::Failed
                        };
                        e.steps_compensated = compensated_steps.clone();
                        e.current_step = None;
                        e.completed_at_epoch_millis = Some(epoch_millis());
                        e.context = ctx.clone();
                    });

                    return SagaReport {
                        status: if all_compensated {
                            SagaOutcome::Compensated
                        } else {
                            SagaOutcome::CompensationFailed
                        },
                        saga_id,
                        context: ctx,
                        error: Some(error_text),
                        failed_step: Some(step.name.clone()),
                        compensated_steps,
                    };
                }
            }
        }

        self.update_execution(&saga_id, |e| {
            e.status = SagaStatus::Completed;
            e.current_step = None;
            e.completed_at_epoch_millis = Some(epoch_millis());
            e.context = ctx.clone();
        });
        self.emit(SagaEventKind::SagaCompleted, &saga_id, None, None).await;

        SagaReport {
            status: SagaOutcome::Completed,
            saga_id,
            context: ctx,
            error: None,
            failed_step: None,
            compensated_steps: Vec::new(),
        }
    }

    /// Look up the retained execution record for a saga.
    pub fn get_execution(&self, saga_id: &str) -> Option<SagaExecution> {
        let executions = self.executions.lock().expect("saga executions poisoned");
        executions.get(saga_id).cloned()
    }

    /// All retained execution records, in no particular order.
    pub fn all_executions(&self) -> Vec<SagaExecution> {
        let executions = self.executions.lock().expect("saga executions poisoned");
        executions.values().cloned().collect()
    }

    async fn execute_with_retry(
        &self,
        step: &SagaStep,
        ctx: &SagaContext,
    ) -> Result<SagaContext, StepError> {
        let mut last_error: Option<StepError> = None;

        for attempt in 0..step.retries {
            let fut = (step.action)(ctx.clone());
            match tokio::time::timeout(step.timeout, fut).await {
                Ok(Ok(patch)) => return Ok(patch),
                Ok(Err(e)) => {
                    debug!(step = %step.name, attempt, error = %e, "saga step attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(step = %step.name, attempt, "saga step attempt timed out");
                    last_error = Some(Box::new(StepTimeout {
                        step: step.name.clone(),
                        timeout: step.timeout,
                    }));
                }
            }

            if attempt + 1 < step.retries {
                // Exponential backoff, no jitter: 100ms, 200ms, 400ms, ...
                let delay = Duration::from_secs_f64(0.1 * 2f64.powi(attempt as i32));
                self.sleeper.sleep(delay).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| format!("step '{}' has no attempt budget", step.name).into()))
    }

    // Compensates completed steps in reverse order, one attempt each. A
    // failing compensation is recorded and the sweep continues.
    async fn compensate(
        &self,
        saga_id: &str,
        completed: &[&SagaStep],
        ctx: &SagaContext,
    ) -> (bool, Vec<String>) {
        self.update_execution(saga_id, |e| e.status = SagaStatus::Compensating);
        self.emit(SagaEventKind::CompensationStarted, saga_id, None, None).await;

        let mut all_compensated = true;
        let mut compensated_steps = Vec::new();

        for step in completed.iter().rev() {
            let Some(compensate) = &step.compensate else {
                continue;
            };

            self.update_execution(saga_id, |e| {
                e.current_step = Some(format!("compensate_{}", step.name));
            });
            self.emit(SagaEventKind::CompensationStepStarted, saga_id, Some(&step.name), None)
                .await;

            match compensate(ctx.clone()).await {
                Ok(()) => {
                    compensated_steps.push(step.name.clone());
                    self.emit(
                        SagaEventKind::CompensationStepCompleted,
                        saga_id,
                        Some(&step.name),
                        None,
                    )
                    .await;
                }
                Err(e) => {
                    all_compensated = false;
                    warn!(
                        saga_id = %saga_id,
                        step = %step.name,
                        error = %e,
                        "compensation failed, continuing sweep"
                    );
                    self.emit(
                        SagaEventKind::CompensationStepFailed,
                        saga_id,
                        Some(&step.name),
                        Some(&e.to_string()),
                    )
                    .await;
                }
            }
        }

        self.emit(SagaEventKind::CompensationCompleted, saga_id, None, None).await;
        (all_compensated, compensated_steps)
    }

    async fn emit(
        &self,
        kind: SagaEventKind,
        saga_id: &str,
        step: Option<&str>,
        error: Option<&str>,
    ) {
        if self.observers.is_empty() {
            return;
        }
        let event = SagaEvent {
            kind,
            saga_id: saga_id.to_string(),
            step: step.map(str::to_string),
            error: error.map(str::to_string),
            timestamp_epoch_millis: epoch_millis(),
        };
        for observer in &self.observers {
            // Observer panics must never break the saga.
            let _ = AssertUnwindSafe(observer.on_event(&event)).catch_unwind().await;
        }
    }

    fn update_execution<F: FnOnce(&mut SagaExecution)>(&self, saga_id: &str, f: F) {
        let mut executions = self.executions.lock().expect("saga executions poisoned");
        if let Some(execution) = executions.get_mut(saga_id) {
            f(execution);
        }
    }
}

fn new_saga_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("SAGA-{}", hex[..8].to_uppercase())
}

fn epoch_millis() -> u64 {
    u64::try_from(
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis(),
    )
    .unwrap_or(u64::MAX)
}

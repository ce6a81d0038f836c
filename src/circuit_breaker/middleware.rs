//! Tower middleware that runs every inner call under a shared breaker.

use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that guards a service with a [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    /// Create a layer sharing `breaker` across every wrapped service.
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService { inner: service, breaker: self.breaker.clone() }
    }
}

/// Middleware service that records every call outcome against the breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S, Req> Service<Req> for CircuitBreakerService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: std::fmt::Display + Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BreakerError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(BreakerError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let breaker = self.breaker.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Err(rejection) = breaker.try_enter().await {
                return Err(BreakerError::Rejected(rejection));
            }
            match inner.call(req).await {
                Ok(response) => {
                    breaker.record_outcome(true, None).await;
                    Ok(response)
                }
                Err(e) => {
                    breaker.record_outcome(false, Some(&e.to_string())).await;
                    Err(BreakerError::Inner(e))
                }
            }
        })
    }
}

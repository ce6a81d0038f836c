#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Backstop
//!
//! Integration-resilience building blocks for services that call flaky
//! dependencies: circuit breakers, compensating sagas, and a lightweight
//! API gateway with token-bucket rate limiting.
//!
//! ## Features
//!
//! - **Circuit breakers** with half-open recovery, a named registry, and a
//!   tower middleware layer
//! - **Saga orchestration** with per-step retry, timeout, and automatic
//!   reverse-order compensation
//! - **Token-bucket rate limiting** with per-client buckets and
//!   `X-RateLimit-*` headers
//! - **API gateway** routing with prefix matching, method filtering, and
//!   request metrics
//!
//! ## Quick Start
//!
//! ```rust
//! use backstop::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30), 2)
//!         .expect("valid config");
//!     let breaker = CircuitBreaker::new("billing", config).expect("valid config");
//!
//!     let result: Result<&str, BreakerError<std::io::Error>> =
//!         breaker.run(|| async { Ok("charged") }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod gateway;
pub mod rate_limit;
pub mod saga;
pub mod sleeper;

// Re-exports
pub use circuit_breaker::middleware::{CircuitBreakerLayer, CircuitBreakerService};
pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerStatus, CircuitConfigError, CircuitState,
};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use clock::{Clock, MonotonicClock};
pub use gateway::{ApiGateway, GatewayRequest, GatewayResponse, RouteConfig};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter, TokenBucket};
pub use saga::subscription::{
    subscription_saga, SimulatedSubscriptionServices, SubscriptionServices,
};
pub use saga::{
    SagaContext, SagaObserver, SagaOrchestrator, SagaOutcome, SagaReport, SagaStep, StepError,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

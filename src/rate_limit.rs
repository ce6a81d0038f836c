//! Token-bucket rate limiting with per-client buckets.
//!
//! [`TokenBucket`] is the leaf primitive: a single-resource counter refilled
//! lazily from elapsed time at `consume()` time, never by a background timer.
//! [`RateLimiter`] owns one bucket per client key and turns bucket state into
//! the informational `X-RateLimit-*` headers the gateway attaches to every
//! decision.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Rate limit settings applied per client key.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    requests_per_minute: u32,
    burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_minute: 100, burst_size: 10 }
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_minute: u32, burst_size: u32) -> Self {
        Self { requests_per_minute, burst_size }
    }

    /// Sustained refill rate, expressed per minute.
    pub fn requests_per_minute(&self) -> u32 {
        self.requests_per_minute
    }

    /// Bucket capacity: how many requests may arrive back-to-back.
    pub fn burst_size(&self) -> u32 {
        self.burst_size
    }

    fn refill_rate_per_sec(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }
}

/// A token bucket with lazy time-based refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_update_millis: u64,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens that refills at
    /// `refill_rate` tokens per second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self::with_clock_arc(capacity, refill_rate, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(capacity: f64, refill_rate: f64, clock: C) -> Self {
        Self::with_clock_arc(capacity, refill_rate, Arc::new(clock))
    }

    fn with_clock_arc(capacity: f64, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self { capacity, refill_rate, tokens: capacity, last_update_millis: now, clock }
    }

    /// Try to consume `permits` tokens, refilling from elapsed time first.
    ///
    /// The refill is capped at `capacity`, so `tokens` never exceeds it.
    pub fn consume(&mut self, permits: f64) -> bool {
        let now = self.clock.now_millis();
        let elapsed_secs = (now.saturating_sub(self.last_update_millis)) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
        self.last_update_millis = now;

        if self.tokens >= permits {
            self.tokens -= permits;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn remaining(&self) -> u32 {
        self.tokens as u32
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Seconds until the bucket is full again at the current refill rate.
    pub fn reset_in_secs(&self) -> u64 {
        if self.refill_rate > 0.0 {
            ((self.capacity - self.tokens) / self.refill_rate) as u64
        } else {
            0
        }
    }
}

/// Result of a rate-limit check, with everything needed for response headers.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured requests-per-minute limit.
    pub limit: u32,
    /// Whole tokens left after this check.
    pub remaining: u32,
    /// Epoch-seconds estimate of when full capacity is restored.
    pub reset_epoch_secs: u64,
}

impl RateLimitDecision {
    /// The informational headers attached to every gateway response.
    pub fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            ("X-RateLimit-Limit".to_string(), self.limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), self.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), self.reset_epoch_secs.to_string()),
        ])
    }
}

/// Per-client rate limiter: one lazily-created [`TokenBucket`] per key.
///
/// Buckets are never evicted; callers are expected to reuse long-lived client
/// ids rather than minting fresh keys per request.
#[derive(Debug)]
pub struct RateLimiter {
    default_config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            buckets: Mutex::new(HashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock used by every bucket created after this call.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Check whether `client_id` may make one request.
    ///
    /// The client's bucket is created on first sight from `config` (or the
    /// limiter default): capacity = burst_size, refill = requests_per_minute
    /// divided by 60.
    pub fn check(&self, client_id: &str, config: Option<&RateLimitConfig>) -> RateLimitDecision {
        let cfg = config.unwrap_or(&self.default_config);
        let mut buckets = self.buckets.lock().expect("rate limiter buckets poisoned");
        let bucket = buckets.entry(client_id.to_string()).or_insert_with(|| {
            TokenBucket::with_clock_arc(
                f64::from(cfg.burst_size),
                cfg.refill_rate_per_sec(),
                self.clock.clone(),
            )
        });

        let allowed = bucket.consume(1.0);
        RateLimitDecision {
            allowed,
            limit: cfg.requests_per_minute,
            remaining: bucket.remaining(),
            reset_epoch_secs: epoch_secs() + bucket.reset_in_secs(),
        }
    }

    /// Number of client buckets currently tracked.
    pub fn active_clients(&self) -> usize {
        self.buckets.lock().expect("rate limiter buckets poisoned").len()
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

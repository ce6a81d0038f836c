//! API gateway request pipeline: route matching, method checks, rate
//! limiting, metering.
//!
//! The gateway authorizes and meters inbound requests, then returns a routing
//! decision naming the target service. Actual forwarding is the caller's
//! responsibility; this keeps the pipeline free of transport concerns.
//!
//! Route resolution is longest-prefix match, so overlapping prefixes like
//! `/api` and `/api/v2` resolve deterministically regardless of registration
//! order.

use crate::rate_limit::{RateLimitConfig, RateLimiter};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const REQUEST_LOG_CAP: usize = 1000;
const REQUEST_LOG_KEEP: usize = 500;

/// Configuration for one routed path prefix.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    path_prefix: String,
    service_name: String,
    rate_limit: Option<RateLimitConfig>,
    require_auth: bool,
    allowed_methods: Vec<String>,
}

impl RouteConfig {
    /// Route `path_prefix` to `service_name` with the default method set
    /// (GET/POST/PUT/DELETE) and the gateway-wide rate limit.
    pub fn new(path_prefix: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            service_name: service_name.into(),
            rate_limit: None,
            require_auth: true,
            allowed_methods: ["GET", "POST", "PUT", "DELETE"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }

    /// Override the gateway-wide rate limit for this route.
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Restrict the allowed methods. Panics on an empty set.
    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        assert!(!methods.is_empty(), "allowed_methods must be non-empty");
        self.allowed_methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Mark the route as not requiring authentication.
    pub fn without_auth(mut self) -> Self {
        self.require_auth = false;
        self
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn rate_limit(&self) -> Option<&RateLimitConfig> {
        self.rate_limit.as_ref()
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    pub fn allowed_methods(&self) -> &[String] {
        &self.allowed_methods
    }
}

/// An inbound request as seen by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub path: String,
    pub method: String,
    pub client_id: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl GatewayRequest {
    pub fn new(
        path: impl Into<String>,
        method: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            method: method.into(),
            client_id: client_id.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// The routing decision returned for every request.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// One entry in the bounded request log.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub timestamp_epoch_millis: u64,
    pub path: String,
    pub method: String,
    pub client_id: String,
    pub status: u16,
    pub service: Option<String>,
    pub latency_ms: Option<u64>,
    pub rate_limited: bool,
}

/// Aggregate gateway counters.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMetrics {
    pub total_requests: u64,
    pub rate_limited: u64,
    pub requests_by_route: HashMap<String, u64>,
    pub routes_count: usize,
    pub active_rate_limits: usize,
}

/// Introspection entry for admin tooling.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub path: String,
    pub service: String,
    pub methods: Vec<String>,
    /// Requests-per-minute override, `None` when the gateway default applies.
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Default)]
struct GatewayState {
    routes: Vec<RouteConfig>,
    requests_by_route: HashMap<String, u64>,
    total_requests: u64,
    rate_limited: u64,
    request_log: Vec<RequestLogEntry>,
}

/// API gateway composing a route table with a per-client rate limiter.
///
/// Interior state is guarded by a `Mutex` and only mutated in synchronous
/// sections; [`handle_request`](Self::handle_request) has no suspension
/// point, so it is a plain method rather than an `async fn`.
#[derive(Debug)]
pub struct ApiGateway {
    state: Mutex<GatewayState>,
    rate_limiter: RateLimiter,
}

impl Default for ApiGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiGateway {
    pub fn new() -> Self {
        Self::with_rate_limiter(RateLimiter::default())
    }

    /// Build a gateway around a pre-configured limiter (custom default
    /// limits or an injected clock).
    pub fn with_rate_limiter(rate_limiter: RateLimiter) -> Self {
        Self { state: Mutex::new(GatewayState::default()), rate_limiter }
    }

    /// Register a route. Re-registering a prefix replaces the previous route
    /// and logs a warning; last registration wins.
    pub fn register_route(&self, config: RouteConfig) {
        let mut state = self.state.lock().expect("gateway state poisoned");
        if let Some(existing) =
            state.routes.iter_mut().find(|r| r.path_prefix == config.path_prefix)
        {
            warn!(target: "backstop::gateway", prefix = %config.path_prefix, "route prefix replaced; last registration wins");
            *existing = config;
            return;
        }
        state.requests_by_route.insert(config.path_prefix.clone(), 0);
        state.routes.push(config);
    }

    /// Run one request through the pipeline: route match, method check, rate
    /// limit, metering. Returns the decision envelope; forwarding to the
    /// named service is the caller's job.
    pub fn handle_request(&self, req: &GatewayRequest) -> GatewayResponse {
        let start = Instant::now();
        let mut state = self.state.lock().expect("gateway state poisoned");
        state.total_requests += 1;

        let route = match Self::match_route(&state.routes, &req.path) {
            Some(route) => route,
            None => {
                debug!(target: "backstop::gateway", path = %req.path, "no route matched");
                Self::log(&mut state, Self::entry(req, 404, None, None, false));
                return GatewayResponse {
                    status: 404,
                    headers: HashMap::new(),
                    body: error_body("NOT_FOUND", &format!("No route for {}", req.path)),
                };
            }
        };

        if !route.allowed_methods.iter().any(|m| m == &req.method) {
            Self::log(&mut state, Self::entry(req, 405, None, None, false));
            return GatewayResponse {
                status: 405,
                headers: HashMap::new(),
                body: error_body(
                    "METHOD_NOT_ALLOWED",
                    &format!("{} not allowed on {}", req.method, route.path_prefix),
                ),
            };
        }

        let decision = self.rate_limiter.check(&req.client_id, route.rate_limit.as_ref());
        if !decision.allowed {
            state.rate_limited += 1;
            debug!(target: "backstop::gateway", client = %req.client_id, path = %req.path, "rate limited");
            Self::log(&mut state, Self::entry(req, 429, None, None, true));
            let mut headers = decision.headers();
            headers.insert("Retry-After".to_string(), "60".to_string());
            return GatewayResponse {
                status: 429,
                headers,
                body: json!({
                    "error": {
                        "code": "RATE_LIMIT_EXCEEDED",
                        "message": "Too many requests",
                        "retry_after": 60,
                    }
                }),
            };
        }

        *state.requests_by_route.entry(route.path_prefix.clone()).or_insert(0) += 1;
        let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        Self::log(
            &mut state,
            Self::entry(req, 200, Some(route.service_name.clone()), Some(latency_ms), false),
        );

        let mut headers = decision.headers();
        headers.insert("X-Service".to_string(), route.service_name.clone());
        headers.insert("X-Gateway-Latency".to_string(), latency_ms.to_string());
        GatewayResponse {
            status: 200,
            headers,
            body: json!({
                "routed_to": route.service_name,
                "original_path": req.path,
            }),
        }
    }

    /// Aggregate counters plus route/limiter cardinality.
    pub fn metrics(&self) -> GatewayMetrics {
        let state = self.state.lock().expect("gateway state poisoned");
        GatewayMetrics {
            total_requests: state.total_requests,
            rate_limited: state.rate_limited,
            requests_by_route: state.requests_by_route.clone(),
            routes_count: state.routes.len(),
            active_rate_limits: self.rate_limiter.active_clients(),
        }
    }

    /// Registered routes for introspection/admin tooling.
    pub fn routes(&self) -> Vec<RouteSummary> {
        let state = self.state.lock().expect("gateway state poisoned");
        state
            .routes
            .iter()
            .map(|r| RouteSummary {
                path: r.path_prefix.clone(),
                service: r.service_name.clone(),
                methods: r.allowed_methods.clone(),
                rate_limit: r.rate_limit.as_ref().map(|c| c.requests_per_minute()),
            })
            .collect()
    }

    /// Snapshot of the bounded request log, oldest first.
    pub fn request_log(&self) -> Vec<RequestLogEntry> {
        let state = self.state.lock().expect("gateway state poisoned");
        state.request_log.clone()
    }

    // Longest matching prefix wins; ties are impossible because prefixes are
    // unique after registration.
    fn match_route(routes: &[RouteConfig], path: &str) -> Option<RouteConfig> {
        routes
            .iter()
            .filter(|r| path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len())
            .cloned()
    }

    fn entry(
        req: &GatewayRequest,
        status: u16,
        service: Option<String>,
        latency_ms: Option<u64>,
        rate_limited: bool,
    ) -> RequestLogEntry {
        RequestLogEntry {
            timestamp_epoch_millis: epoch_millis(),
            path: req.path.clone(),
            method: req.method.clone(),
            client_id: req.client_id.clone(),
            status,
            service,
            latency_ms,
            rate_limited,
        }
    }

    fn log(state: &mut GatewayState, entry: RequestLogEntry) {
        state.request_log.push(entry);
        if state.request_log.len() > REQUEST_LOG_CAP {
            let excess = state.request_log.len() - REQUEST_LOG_KEEP;
            state.request_log.drain(..excess);
        }
    }
}

fn error_body(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

fn epoch_millis() -> u64 {
    u64::try_from(
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis(),
    )
    .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    fn gateway() -> ApiGateway {
        ApiGateway::with_rate_limiter(
            RateLimiter::new(RateLimitConfig::default()).with_clock(ManualClock::new()),
        )
    }

    #[test]
    fn unknown_path_returns_404() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api", "core"));

        let response = gateway.handle_request(&GatewayRequest::new("/unknown", "GET", "c1"));
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"]["code"], "NOT_FOUND");
    }

    #[test]
    fn disallowed_method_returns_405() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api", "core").with_methods(&["GET"]));

        let response = gateway.handle_request(&GatewayRequest::new("/api/x", "POST", "c1"));
        assert_eq!(response.status, 405);
        assert_eq!(response.body["error"]["code"], "METHOD_NOT_ALLOWED");
    }

    #[test]
    fn success_envelope_names_the_service() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api/policies", "policy-admin"));

        let response =
            gateway.handle_request(&GatewayRequest::new("/api/policies/42", "GET", "c1"));
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("X-Service").map(String::as_str), Some("policy-admin"));
        assert!(response.headers.contains_key("X-Gateway-Latency"));
        assert!(response.headers.contains_key("X-RateLimit-Remaining"));
        assert_eq!(response.body["routed_to"], "policy-admin");
        assert_eq!(response.body["original_path"], "/api/policies/42");
    }

    #[test]
    fn longest_prefix_wins_over_registration_order() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api", "core"));
        gateway.register_route(RouteConfig::new("/api/v2", "core-v2"));

        let response = gateway.handle_request(&GatewayRequest::new("/api/v2/things", "GET", "c1"));
        assert_eq!(response.headers.get("X-Service").map(String::as_str), Some("core-v2"));

        let response = gateway.handle_request(&GatewayRequest::new("/api/other", "GET", "c1"));
        assert_eq!(response.headers.get("X-Service").map(String::as_str), Some("core"));
    }

    #[test]
    fn rate_limited_request_returns_429_with_retry_after() {
        let gateway = gateway();
        gateway.register_route(
            RouteConfig::new("/api", "core").with_rate_limit(RateLimitConfig::new(60, 1)),
        );

        let request = GatewayRequest::new("/api/x", "GET", "c1");
        assert_eq!(gateway.handle_request(&request).status, 200);

        let denied = gateway.handle_request(&request);
        assert_eq!(denied.status, 429);
        assert_eq!(denied.headers.get("Retry-After").map(String::as_str), Some("60"));
        assert_eq!(denied.headers.get("X-RateLimit-Remaining").map(String::as_str), Some("0"));
        assert_eq!(denied.body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn metrics_count_every_outcome() {
        let gateway = gateway();
        gateway.register_route(
            RouteConfig::new("/api", "core").with_rate_limit(RateLimitConfig::new(60, 1)),
        );

        let request = GatewayRequest::new("/api/x", "GET", "c1");
        gateway.handle_request(&request); // 200
        gateway.handle_request(&request); // 429
        gateway.handle_request(&GatewayRequest::new("/nope", "GET", "c1")); // 404

        let metrics = gateway.metrics();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.rate_limited, 1);
        assert_eq!(metrics.requests_by_route.get("/api"), Some(&1));
        assert_eq!(metrics.routes_count, 1);
        assert_eq!(metrics.active_rate_limits, 1);
    }

    #[test]
    fn request_log_trims_to_most_recent_500_on_overflow() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api", "core"));

        for i in 0..1001 {
            gateway.handle_request(&GatewayRequest::new(format!("/api/{i}"), "GET", "c1"));
        }

        let log = gateway.request_log();
        assert_eq!(log.len(), 500);
        assert_eq!(log.last().map(|e| e.path.as_str()), Some("/api/1000"));
        assert_eq!(log.first().map(|e| e.path.as_str()), Some("/api/501"));
    }

    #[test]
    fn routes_lists_registered_configuration() {
        let gateway = gateway();
        gateway.register_route(
            RouteConfig::new("/api/claims", "claims")
                .with_methods(&["GET", "POST"])
                .with_rate_limit(RateLimitConfig::new(30, 5)),
        );

        let routes = gateway.routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].path, "/api/claims");
        assert_eq!(routes[0].service, "claims");
        assert_eq!(routes[0].methods, vec!["GET".to_string(), "POST".to_string()]);
        assert_eq!(routes[0].rate_limit, Some(30));
    }

    #[test]
    fn reregistering_a_prefix_replaces_the_route() {
        let gateway = gateway();
        gateway.register_route(RouteConfig::new("/api", "old"));
        gateway.register_route(RouteConfig::new("/api", "new"));

        let response = gateway.handle_request(&GatewayRequest::new("/api/x", "GET", "c1"));
        assert_eq!(response.headers.get("X-Service").map(String::as_str), Some("new"));
        assert_eq!(gateway.routes().len(), 1);
    }
}

//! Gateway routing and rate limiting through the public API.

use backstop::{ApiGateway, GatewayRequest, RateLimitConfig, RateLimiter, RouteConfig};

#[test]
fn unknown_path_is_404_and_disallowed_method_is_405() {
    let gateway = ApiGateway::new();
    gateway.register_route(RouteConfig::new("/api", "api-service").with_methods(&["GET"]));

    let post = gateway.handle_request(&GatewayRequest::new("/api/x", "POST", "client-1"));
    assert_eq!(post.status, 405);

    let missing = gateway.handle_request(&GatewayRequest::new("/unknown", "GET", "client-1"));
    assert_eq!(missing.status, 404);

    let ok = gateway.handle_request(&GatewayRequest::new("/api/x", "GET", "client-1"));
    assert_eq!(ok.status, 200);
    assert_eq!(ok.headers.get("X-Service").map(String::as_str), Some("api-service"));
}

#[test]
fn burst_is_allowed_then_the_next_request_is_429() {
    let limiter = RateLimiter::new(RateLimitConfig::new(60, 5));
    let gateway = ApiGateway::with_rate_limiter(limiter);
    gateway.register_route(RouteConfig::new("/api", "api-service"));

    let req = GatewayRequest::new("/api/quotes", "GET", "client-1");
    for _ in 0..5 {
        let response = gateway.handle_request(&req);
        assert_eq!(response.status, 200);
    }

    let denied = gateway.handle_request(&req);
    assert_eq!(denied.status, 429);
    assert_eq!(denied.headers.get("X-RateLimit-Remaining").map(String::as_str), Some("0"));
    assert_eq!(denied.headers.get("Retry-After").map(String::as_str), Some("60"));

    let metrics = gateway.metrics();
    assert_eq!(metrics.total_requests, 6);
    assert_eq!(metrics.rate_limited, 1);
}

#[test]
fn standalone_limiter_matches_the_documented_burst_behavior() {
    let limiter = RateLimiter::new(RateLimitConfig::new(60, 5));

    for _ in 0..5 {
        assert!(limiter.check("client-1", None).allowed);
    }

    let denied = limiter.check("client-1", None);
    assert!(!denied.allowed);
    assert_eq!(denied.headers().get("X-RateLimit-Remaining").map(String::as_str), Some("0"));
    assert!(limiter.check("client-2", None).allowed, "other clients are unaffected");
}

#[test]
fn longest_registered_prefix_wins_for_overlapping_routes() {
    let gateway = ApiGateway::new();
    gateway.register_route(RouteConfig::new("/api", "api-v1"));
    gateway.register_route(RouteConfig::new("/api/v2", "api-v2"));

    let response = gateway.handle_request(&GatewayRequest::new("/api/v2/quotes", "GET", "c"));
    assert_eq!(response.headers.get("X-Service").map(String::as_str), Some("api-v2"));

    let fallback = gateway.handle_request(&GatewayRequest::new("/api/v1/quotes", "GET", "c"));
    assert_eq!(fallback.headers.get("X-Service").map(String::as_str), Some("api-v1"));
}

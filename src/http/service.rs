//! Rate limit middleware and routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{error, instrument};

use crate::config::RateLimitingConfig;
use crate::error::{Result, WardenError};
use crate::ratelimit::{RateLimiter, Verdict};

/// Message returned with every 429 response.
const OVER_LIMIT_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// State shared by the rate limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    /// The rate limiter instance
    limiter: Arc<RateLimiter>,
    /// Header carrying the API token
    token_header: HeaderName,
    /// Admit requests when the store fails
    fail_open: bool,
}

impl RateLimitState {
    /// Create middleware state from a limiter and its configuration.
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitingConfig) -> Result<Self> {
        let token_header = HeaderName::from_bytes(config.token_header.as_bytes()).map_err(|e| {
            WardenError::Config(format!("invalid token header '{}': {}", config.token_header, e))
        })?;

        Ok(Self {
            limiter,
            token_header,
            fail_open: config.fail_open,
        })
    }
}

/// Build the application router with the rate limit middleware in front.
pub fn router(state: RateLimitState) -> Router {
    Router::new()
        .route("/", any(root))
        .layer(middleware::from_fn_with_state(state, enforce_rate_limit))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Request successful",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// Admit, reject, or fail a request according to its rate limit verdict.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn enforce_rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(&state.token_header)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let ip = client_ip(&request);

    match state.limiter.check(token.as_deref(), &ip).await {
        Ok(Verdict::Denied { retry_after }) => too_many_requests(retry_after),
        Ok(_) => next.run(request).await,
        Err(err) if state.fail_open => {
            error!(ip = %ip, error = %err, "Rate limiter unavailable, failing open");
            next.run(request).await
        }
        Err(err) => {
            error!(ip = %ip, error = %err, "Rate limiter unavailable, failing closed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

fn too_many_requests(retry_after: Duration) -> Response {
    let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after_secs.to_string())],
        Json(json!({
            "error": OVER_LIMIT_MESSAGE,
            "retry_after": retry_after.as_secs_f64(),
        })),
    )
        .into_response()
}

/// Extract the client address, trusting forwarding headers first.
pub fn client_ip<B>(request: &axum::http::Request<B>) -> String {
    let headers = request.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateLimitError;
    use crate::ratelimit::{Decision, LimitPolicy, LocalStore, WindowStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use tower::ServiceExt;

    struct UnavailableStore;

    #[async_trait]
    impl WindowStore for UnavailableStore {
        async fn allow(&self, _: &str, _: u32, _: Duration) -> std::result::Result<Decision, RateLimitError> {
            Err(RateLimitError::BackendUnavailable("connection refused".to_string()))
        }
    }

    fn config(ip_limit: u32, token_limit: u32) -> RateLimitingConfig {
        RateLimitingConfig {
            ip_limit,
            token_limit,
            block_time_secs: 2,
            ..RateLimitingConfig::default()
        }
    }

    fn test_router(store: Arc<dyn WindowStore>, config: &RateLimitingConfig) -> Router {
        let limiter = Arc::new(RateLimiter::new(store, LimitPolicy::from(config)));
        router(RateLimitState::new(limiter, config).unwrap())
    }

    fn request(ip: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", ip);
        if let Some(token) = token {
            builder = builder.header("API_KEY", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_ip_rate_limiting() {
        let app = test_router(Arc::new(LocalStore::new()), &config(5, 100));

        for i in 1..=5 {
            let response = app.clone().oneshot(request("1.2.3.4", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "Request {} should be allowed", i);
        }

        let response = app.clone().oneshot(request("1.2.3.4", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let body = body_json(response).await;
        assert_eq!(body["error"], OVER_LIMIT_MESSAGE);
        assert_eq!(body["retry_after"], 2.0);
    }

    #[tokio::test]
    async fn test_allowed_response_body() {
        let app = test_router(Arc::new(LocalStore::new()), &config(5, 10));

        let response = app.oneshot(request("1.2.3.4", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Request successful");
        assert!(body["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn test_token_rate_limiting() {
        let app = test_router(Arc::new(LocalStore::new()), &config(10, 3));

        for i in 1..=3 {
            let response = app
                .clone()
                .oneshot(request("1.2.3.4", Some("test-token-123")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "Token request {} should be allowed", i);
        }

        let response = app
            .clone()
            .oneshot(request("1.2.3.4", Some("test-token-123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_token_precedence_over_ip() {
        let app = test_router(Arc::new(LocalStore::new()), &config(2, 10));

        for i in 1..=5 {
            let response = app
                .clone()
                .oneshot(request("1.2.3.4", Some("precedence-token")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "Request with token {} should be allowed", i);
        }
    }

    #[tokio::test]
    async fn test_disabled_limiters() {
        let mut ip_disabled = config(1, 1);
        ip_disabled.enable_ip_limit = false;
        let app = test_router(Arc::new(LocalStore::new()), &ip_disabled);
        for _ in 0..5 {
            let response = app.clone().oneshot(request("1.2.3.4", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let mut token_disabled = config(5, 1);
        token_disabled.enable_token_limit = false;
        let app = test_router(Arc::new(LocalStore::new()), &token_disabled);
        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(request("1.2.3.4", Some("any-token")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_different_ips_different_counters() {
        let app = test_router(Arc::new(LocalStore::new()), &config(1, 10));

        let response = app.clone().oneshot(request("10.0.0.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(request("10.0.0.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = app.clone().oneshot(request("10.0.0.2", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests() {
        let app = test_router(Arc::new(LocalStore::new()), &config(10, 10));

        let handles: Vec<_> = (0..15)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { app.oneshot(request("5.6.7.8", None)).await.unwrap().status() })
            })
            .collect();

        let mut ok = 0;
        let mut limited = 0;
        for status in futures::future::join_all(handles).await {
            match status.unwrap() {
                StatusCode::OK => ok += 1,
                StatusCode::TOO_MANY_REQUESTS => limited += 1,
                other => panic!("unexpected status {}", other),
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(limited, 5);
    }

    #[tokio::test]
    async fn test_backend_error_fails_closed() {
        let app = test_router(Arc::new(UnavailableStore), &config(5, 10));

        let response = app.oneshot(request("1.2.3.4", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn test_backend_error_fails_open_when_configured() {
        let mut config = config(5, 10);
        config.fail_open = true;
        let app = test_router(Arc::new(UnavailableStore), &config);

        let response = app.oneshot(request("1.2.3.4", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_invalid_token_header_rejected() {
        let mut config = config(5, 10);
        config.token_header = "bad header".to_string();
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(LocalStore::new()),
            LimitPolicy::from(&config),
        ));

        assert!(matches!(
            RateLimitState::new(limiter, &config),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_client_ip_uses_first_forwarded_address() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&request), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let request = axum::http::Request::builder()
            .header("x-real-ip", "198.51.100.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&request), "198.51.100.1");

        let mut request = axum::http::Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&request), "unknown");

        let peer: SocketAddr = "192.0.2.10:50000".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        assert_eq!(client_ip(&request), "192.0.2.10");
    }

    #[test]
    fn test_retry_after_header_rounds_up() {
        let response = too_many_requests(Duration::from_millis(1500));
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let response = too_many_requests(Duration::from_secs(3));
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }
}

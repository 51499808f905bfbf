use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};

/// Backend health as maintained by the prober. Backends start healthy so a
/// cold pool serves traffic before the first probe lands.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<DateTime<Utc>>,
    pub check_count: u64,
    pub fail_count: u64,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_healthy: None,
            check_count: 0,
            fail_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub health_check_path: String,
    pub timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            health_check_path: "/".to_string(),
            timeout: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// An upstream backend: reverse-proxy capability plus a private circuit
/// breaker and prober-maintained health state.
pub struct Backend {
    name: String,
    url: reqwest::Url,
    weight: u32,
    health_check_path: String,
    client: reqwest::Client,
    health: RwLock<HealthStatus>,
    breaker: CircuitBreaker,
}

impl Backend {
    pub fn new(name: &str, raw_url: &str, weight: u32) -> Result<Self> {
        Self::with_options(name, raw_url, weight, BackendOptions::default())
    }

    pub fn with_options(
        name: &str,
        raw_url: &str,
        weight: u32,
        mut opts: BackendOptions,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(raw_url)
            .with_context(|| format!("invalid backend URL: {}", raw_url))?;

        if opts.health_check_path.is_empty() {
            opts.health_check_path = "/".to_string();
        }
        if opts.timeout.is_zero() {
            opts.timeout = Duration::from_secs(30);
        }

        let client = reqwest::Client::builder()
            .timeout(opts.timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;

        Ok(Self {
            name: name.to_string(),
            url,
            weight,
            health_check_path: opts.health_check_path,
            client,
            health: RwLock::new(HealthStatus::default()),
            breaker: CircuitBreaker::new(opts.circuit_breaker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn health_check_path(&self) -> &str {
        &self.health_check_path
    }

    /// Proxy one request through this backend, gated by the circuit breaker.
    /// Replies with 503 while the circuit rejects, otherwise proxies and
    /// classifies the observed status into the breaker.
    pub async fn dispatch(&self, parts: &Parts, body: Bytes) -> Response {
        if !self.breaker.allow() {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let response = self.proxy(parts, body).await;

        // 5xx (including the locally synthesized 502) counts as failure;
        // everything else, 4xx included, counts as success.
        if response.status().as_u16() >= 500 {
            self.breaker.record_failure();
        } else {
            self.breaker.record_success();
        }

        response
    }

    async fn proxy(&self, parts: &Parts, body: Bytes) -> Response {
        let target = match self.target_url(&parts.uri) {
            Ok(url) => url,
            Err(e) => {
                error!("backend {}: bad target URL: {}", self.name, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in parts.headers.iter() {
            if !strip_request_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let request = self
            .client
            .request(parts.method.clone(), target)
            .headers(headers)
            .body(body);

        let upstream = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("backend {}: upstream request failed: {}", self.name, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut response_headers = HeaderMap::with_capacity(upstream.headers().len());
        for (name, value) in upstream.headers().iter() {
            if !strip_response_header(name) {
                response_headers.append(name.clone(), value.clone());
            }
        }

        let body = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("backend {}: failed to read upstream body: {}", self.name, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }

    fn target_url(&self, uri: &axum::http::Uri) -> Result<reqwest::Url> {
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let base = self.url.as_str().trim_end_matches('/');
        reqwest::Url::parse(&format!("{}{}", base, path_and_query))
            .context("failed to build upstream URL")
    }

    pub(crate) fn circuit_allow(&self) -> bool {
        self.breaker.allow()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset()
    }

    fn health_read(&self) -> RwLockReadGuard<'_, HealthStatus> {
        self.health.read().unwrap_or_else(|e| e.into_inner())
    }

    fn health_write(&self) -> RwLockWriteGuard<'_, HealthStatus> {
        self.health.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_healthy(&self, healthy: bool) {
        let now = Utc::now();
        let mut health = self.health_write();
        health.last_check = Some(now);
        health.check_count += 1;
        if healthy {
            health.healthy = true;
            health.last_healthy = Some(now);
        } else {
            health.healthy = false;
            health.fail_count += 1;
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_read().healthy
    }

    pub fn health_status(&self) -> HealthStatus {
        self.health_read().clone()
    }
}

/// Hop-by-hop request headers never forwarded upstream. Host is rewritten by
/// the client from the upstream URL.
fn strip_request_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Hop-by-hop plus fingerprintable response headers stripped before replying
fn strip_response_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "server"
            | "x-powered-by"
            | "x-aspnet-version"
            | "x-aspnetmvc-version"
            | "x-runtime"
            | "x-version"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    pub(crate) async fn spawn_upstream(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn request_parts(path: &str) -> Parts {
        let (parts, _) = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_new_backend() {
        let backend = Backend::new("primary", "http://127.0.0.1:3000", 10).unwrap();
        assert_eq!(backend.name(), "primary");
        assert_eq!(backend.weight(), 10);
        assert!(backend.is_healthy());
        assert_eq!(backend.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_new_backend_invalid_url() {
        assert!(Backend::new("bad", "://not-a-url", 1).is_err());
    }

    #[test]
    fn test_options_defaults() {
        let opts = BackendOptions {
            health_check_path: String::new(),
            timeout: Duration::ZERO,
            ..BackendOptions::default()
        };
        let backend =
            Backend::with_options("primary", "http://127.0.0.1:3000", 1, opts).unwrap();
        assert_eq!(backend.health_check_path(), "/");
    }

    #[tokio::test]
    async fn test_circuit_opens_then_recovers() {
        use crate::proxy::circuit_breaker::CircuitBreakerConfig;
        use std::sync::atomic::{AtomicU32, Ordering};

        static CALLS: AtomicU32 = AtomicU32::new(0);

        // first five upstream calls fail, everything after succeeds
        let app = Router::new().route(
            "/",
            get(|| async {
                if CALLS.fetch_add(1, Ordering::SeqCst) < 5 {
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                } else {
                    (StatusCode::OK, "recovered")
                }
            }),
        );
        let url = spawn_upstream(app).await;

        let opts = BackendOptions {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                timeout: Duration::from_millis(100),
            },
            ..BackendOptions::default()
        };
        let backend = Backend::with_options("flaky", &url, 1, opts).unwrap();

        // calls 1-5 observe the upstream error and trip the breaker
        for _ in 0..5 {
            let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        assert_eq!(backend.circuit_state(), CircuitState::Open);

        // call 6 is rejected while the circuit is open
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // after the timeout the breaker admits a probe, which succeeds
        tokio::time::sleep(Duration::from_millis(110)).await;
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.circuit_state(), CircuitState::HalfOpen);

        // a second success closes the circuit
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(backend.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dispatch_proxies_to_upstream() {
        let app = Router::new().route("/test", get(|| async { "backend response" }));
        let url = spawn_upstream(app).await;

        let backend = Backend::new("primary", &url, 1).unwrap();
        let response = backend.dispatch(&request_parts("/test"), Bytes::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"backend response");
    }

    #[tokio::test]
    async fn test_dispatch_strips_leaky_headers() {
        let app = Router::new().route(
            "/",
            get(|| async {
                (
                    [("Server", "nginx/1.2"), ("X-Powered-By", "PHP/8.1")],
                    "ok",
                )
            }),
        );
        let url = spawn_upstream(app).await;

        let backend = Backend::new("primary", &url, 1).unwrap();
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("server").is_none());
        assert!(response.headers().get("x-powered-by").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_transport_failure_is_502() {
        // nothing listens here
        let backend = Backend::new("down", "http://127.0.0.1:1", 1).unwrap();
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_dispatch_feeds_circuit_breaker() {
        let backend = Backend::new("down", "http://127.0.0.1:1", 1).unwrap();

        for _ in 0..5 {
            let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }

        // breaker is now open: rejected without touching the upstream
        assert_eq!(backend.circuit_state(), CircuitState::Open);
        let response = backend.dispatch(&request_parts("/"), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_circuit_breaker_reset() {
        let backend = Backend::new("down", "http://127.0.0.1:1", 1).unwrap();
        for _ in 0..5 {
            backend.dispatch(&request_parts("/"), Bytes::new()).await;
        }
        assert_eq!(backend.circuit_state(), CircuitState::Open);

        backend.reset_circuit();
        assert_eq!(backend.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_health_updates() {
        let backend = Backend::new("primary", "http://127.0.0.1:3000", 1).unwrap();

        backend.set_healthy(false);
        assert!(!backend.is_healthy());

        let status = backend.health_status();
        assert_eq!(status.check_count, 1);
        assert_eq!(status.fail_count, 1);
        assert!(status.last_healthy.is_none());

        backend.set_healthy(true);
        let status = backend.health_status();
        assert!(status.healthy);
        assert_eq!(status.check_count, 2);
        assert!(status.last_healthy.is_some());
    }

    #[test]
    fn test_request_header_stripping() {
        for name in ["host", "connection", "transfer-encoding", "upgrade", "te"] {
            assert!(strip_request_header(&HeaderName::from_static(name)), "{}", name);
        }
        assert!(!strip_request_header(&HeaderName::from_static("accept")));
        assert!(!strip_request_header(&HeaderName::from_static(
            "x-request-id"
        )));
    }
}

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use crate::config::{parse_cidr_or_ip, Config};
use crate::listener::Listener;
use crate::observability::Metrics;
use crate::proxy::Pool;

const PROM_PREFIX: &str = "veilgate";

struct AdminInner {
    metrics: Arc<Metrics>,
    pools: HashMap<String, Arc<Pool>>,
    listeners: Vec<Arc<Listener>>,
    config_path: Option<String>,
    start_time: Instant,
    version: &'static str,
    auth_token: Option<String>,
    allowed_nets: Vec<IpNet>,
}

/// Shared state of the admin API. The /health endpoint stays reachable
/// without authentication; everything else passes the allowlist and bearer
/// token checks.
#[derive(Clone)]
pub struct AdminState(Arc<AdminInner>);

pub struct AdminConfig {
    pub metrics: Arc<Metrics>,
    pub pools: HashMap<String, Arc<Pool>>,
    pub listeners: Vec<Arc<Listener>>,
    pub config_path: Option<String>,
    pub auth_token: Option<String>,
    pub allowed_ips: Vec<String>,
}

impl AdminState {
    pub fn new(cfg: AdminConfig) -> Self {
        let allowed_nets = cfg
            .allowed_ips
            .iter()
            .filter_map(|cidr| parse_cidr_or_ip(cidr).ok())
            .collect();

        Self(Arc::new(AdminInner {
            metrics: cfg.metrics,
            pools: cfg.pools,
            listeners: cfg.listeners,
            config_path: cfg.config_path,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            auth_token: cfg.auth_token.filter(|t| !t.is_empty()),
            allowed_nets,
        }))
    }
}

pub fn router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .route("/metrics/prometheus", get(handle_prometheus))
        .route("/backends", get(handle_backends))
        .route("/reload", post(handle_reload))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(handle_health))
        .merge(protected)
        .with_state(state)
}

/// IP allowlist first, then bearer token. Either check alone may be
/// configured.
async fn require_auth(
    State(state): State<AdminState>,
    req: Request,
    next: Next,
) -> Response {
    let inner = &state.0;

    if !inner.allowed_nets.is_empty() {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let allowed = match peer_ip {
            Some(ip) => inner.allowed_nets.iter().any(|net| net.contains(&ip)),
            None => false,
        };

        if !allowed {
            return (StatusCode::FORBIDDEN, "Forbidden").into_response();
        }
    }

    if let Some(expected) = &inner.auth_token {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match token {
            Some(token) if token == expected => {}
            _ => {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(req).await
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_status(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let inner = &state.0;
    let active_connections: i64 = inner
        .listeners
        .iter()
        .map(|l| l.active_connections())
        .sum();

    Json(json!({
        "status": "running",
        "version": inner.version,
        "uptime": format!("{}s", inner.start_time.elapsed().as_secs()),
        "num_cpu": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0),
        "active_connections": active_connections,
        "profiles": inner.pools.len(),
        "memory": { "resident_bytes": resident_memory_bytes() },
    }))
}

async fn handle_metrics(State(state): State<AdminState>) -> Json<crate::observability::metrics::Snapshot> {
    Json(state.0.metrics.snapshot())
}

async fn handle_prometheus(State(state): State<AdminState>) -> Response {
    let inner = &state.0;
    let snapshot = inner.metrics.snapshot();
    let mut out = String::with_capacity(4096);

    let _ = writeln!(
        out,
        "# HELP {p}_requests_total Total number of requests processed\n# TYPE {p}_requests_total counter\n{p}_requests_total {}\n",
        snapshot.total_requests,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_requests_allowed_total Total number of allowed requests\n# TYPE {p}_requests_allowed_total counter\n{p}_requests_allowed_total {}\n",
        snapshot.allowed_requests,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_requests_denied_total Total number of denied requests\n# TYPE {p}_requests_denied_total counter\n{p}_requests_denied_total {}\n",
        snapshot.denied_requests,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_requests_dropped_total Total number of dropped requests\n# TYPE {p}_requests_dropped_total counter\n{p}_requests_dropped_total {}\n",
        snapshot.dropped_requests,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_unique_ips Number of unique client IPs seen\n# TYPE {p}_unique_ips gauge\n{p}_unique_ips {}\n",
        snapshot.unique_ips,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_response_time_ms_avg Average response time in milliseconds\n# TYPE {p}_response_time_ms_avg gauge\n{p}_response_time_ms_avg {:.3}\n",
        snapshot.avg_response_ms,
        p = PROM_PREFIX
    );
    let _ = writeln!(
        out,
        "# HELP {p}_requests_per_second Current request rate\n# TYPE {p}_requests_per_second gauge\n{p}_requests_per_second {:.3}\n",
        snapshot.requests_per_sec,
        p = PROM_PREFIX
    );

    let _ = writeln!(
        out,
        "# HELP {p}_profile_requests_total Requests per profile\n# TYPE {p}_profile_requests_total counter",
        p = PROM_PREFIX
    );
    for (profile, count) in &snapshot.profile_requests {
        let _ = writeln!(
            out,
            "{p}_profile_requests_total{{profile={profile:?}}} {count}",
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_decisions_total Counts by decision type\n# TYPE {p}_decisions_total counter",
        p = PROM_PREFIX
    );
    for (decision, count) in &snapshot.decisions {
        let _ = writeln!(
            out,
            "{p}_decisions_total{{decision={decision:?}}} {count}",
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_rule_hits_total Counts by rule type\n# TYPE {p}_rule_hits_total counter",
        p = PROM_PREFIX
    );
    for (rule, count) in &snapshot.rule_hits {
        let _ = writeln!(
            out,
            "{p}_rule_hits_total{{rule={rule:?}}} {count}",
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_requests_total Total requests per backend\n# TYPE {p}_backend_requests_total counter",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_requests_total{{backend={backend:?}}} {}",
            stats.requests,
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_errors_total Total errors per backend\n# TYPE {p}_backend_errors_total counter",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_errors_total{{backend={backend:?}}} {}",
            stats.errors,
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_latency_ms_avg Average latency per backend in milliseconds\n# TYPE {p}_backend_latency_ms_avg gauge",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_latency_ms_avg{{backend={backend:?}}} {:.3}",
            stats.avg_latency_ms,
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_latency_ms_min Minimum latency per backend in milliseconds\n# TYPE {p}_backend_latency_ms_min gauge",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_latency_ms_min{{backend={backend:?}}} {:.3}",
            stats.min_latency_ms,
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_latency_ms_max Maximum latency per backend in milliseconds\n# TYPE {p}_backend_latency_ms_max gauge",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_latency_ms_max{{backend={backend:?}}} {:.3}",
            stats.max_latency_ms,
            p = PROM_PREFIX
        );
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_error_rate Error rate per backend (percentage)\n# TYPE {p}_backend_error_rate gauge",
        p = PROM_PREFIX
    );
    for (backend, stats) in &snapshot.backend_stats {
        let _ = writeln!(
            out,
            "{p}_backend_error_rate{{backend={backend:?}}} {:.2}",
            stats.error_rate,
            p = PROM_PREFIX
        );
    }

    // Circuit breaker and health gauges come live from the pools
    let _ = writeln!(
        out,
        "\n# HELP {p}_circuit_breaker_state Circuit breaker state (0=closed, 1=open, 2=half-open)\n# TYPE {p}_circuit_breaker_state gauge",
        p = PROM_PREFIX
    );
    for (profile, pool) in &inner.pools {
        for (backend, stats) in pool.circuit_stats() {
            let _ = writeln!(
                out,
                "{p}_circuit_breaker_state{{profile={profile:?},backend={backend:?}}} {}",
                stats.state.as_gauge(),
                p = PROM_PREFIX
            );
        }
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_circuit_breaker_failures Current consecutive failure count\n# TYPE {p}_circuit_breaker_failures gauge",
        p = PROM_PREFIX
    );
    for (profile, pool) in &inner.pools {
        for (backend, stats) in pool.circuit_stats() {
            let _ = writeln!(
                out,
                "{p}_circuit_breaker_failures{{profile={profile:?},backend={backend:?}}} {}",
                stats.consecutive_failures,
                p = PROM_PREFIX
            );
        }
    }

    let _ = writeln!(
        out,
        "\n# HELP {p}_backend_healthy Backend health status (1=healthy, 0=unhealthy)\n# TYPE {p}_backend_healthy gauge",
        p = PROM_PREFIX
    );
    for (profile, pool) in &inner.pools {
        for (backend, status) in pool.health_statuses() {
            let _ = writeln!(
                out,
                "{p}_backend_healthy{{profile={profile:?},backend={backend:?}}} {}",
                u8::from(status.healthy),
                p = PROM_PREFIX
            );
        }
    }

    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        out,
    )
        .into_response()
}

#[derive(Serialize)]
struct BackendStatus {
    name: String,
    url: String,
    weight: u32,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_healthy: Option<DateTime<Utc>>,
    check_count: u64,
    fail_count: u64,
    circuit_breaker: CircuitBreakerInfo,
}

#[derive(Serialize)]
struct CircuitBreakerInfo {
    state: &'static str,
    failures: u32,
    successes: u32,
    last_state_change: DateTime<Utc>,
}

#[derive(Serialize)]
struct ProfileBackends {
    total: usize,
    healthy: usize,
    backends: Vec<BackendStatus>,
}

async fn handle_backends(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let mut profiles = HashMap::new();

    for (profile_id, pool) in &state.0.pools {
        let mut backends = Vec::with_capacity(pool.len());

        for backend in pool.backends() {
            let health = backend.health_status();
            let cb = backend.circuit_stats();
            backends.push(BackendStatus {
                name: backend.name().to_string(),
                url: backend.url().to_string(),
                weight: backend.weight(),
                healthy: health.healthy,
                last_check: health.last_check,
                last_healthy: health.last_healthy,
                check_count: health.check_count,
                fail_count: health.fail_count,
                circuit_breaker: CircuitBreakerInfo {
                    state: cb.state.as_str(),
                    failures: cb.consecutive_failures,
                    successes: cb.consecutive_successes,
                    last_state_change: cb.last_state_change,
                },
            });
        }

        profiles.insert(
            profile_id.clone(),
            ProfileBackends {
                total: pool.len(),
                healthy: pool.healthy_count(),
                backends,
            },
        );
    }

    Json(json!({ "profiles": profiles }))
}

/// Re-validates the on-disk configuration. Changes require restart.
async fn handle_reload(State(state): State<AdminState>) -> Json<serde_json::Value> {
    let path = match &state.0.config_path {
        Some(path) => path.clone(),
        None => {
            return Json(json!({
                "success": false,
                "message": "Reload not configured",
            }));
        }
    };

    match Config::load(&path).await {
        Ok(cfg) => {
            info!(
                profiles = cfg.profiles.len(),
                "configuration validated; restart required for changes to take effect"
            );
            Json(json!({
                "success": true,
                "message": "Configuration reloaded successfully",
            }))
        }
        Err(e) => {
            error!("configuration validation failed: {:#}", e);
            Json(json!({
                "success": false,
                "message": format!("{:#}", e),
            }))
        }
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().nth(1).and_then(|v| v.parse::<u64>().ok()))
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> u64 {
    0
}

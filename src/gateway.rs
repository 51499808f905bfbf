use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use ipnet::IpNet;
use tracing::debug;
use uuid::Uuid;

use crate::config::{parse_cidr_or_ip, GlobalConfig, ProfileConfig};
use crate::decision::{Action, Engine};
use crate::decoy::Decoy;
use crate::error::GatewayError;
use crate::geoip::GeoDb;
use crate::observability::{Logger, Metrics, RequestRecord};
use crate::proxy::Pool;
use crate::rules::{build_group, Context, TlsSnapshot};

pub const DEFAULT_MAX_REQUEST_BODY: u64 = 10 * 1024 * 1024;

const REQUEST_ID_HEADER: &str = "x-request-id";
const TARPIT_MIN: std::time::Duration = std::time::Duration::from_secs(5);
const TARPIT_MAX: std::time::Duration = std::time::Duration::from_secs(30);

/// Per-profile request orchestrator: attribution, request-ID stamping, body
/// bounding, decision dispatch, and observation.
pub struct GatewayHandler {
    profile_id: String,
    engine: Engine,
    pool: Arc<Pool>,
    decoy: Decoy,
    trusted_proxies: Vec<IpNet>,
    max_request_body: usize,
    max_retries: usize,
    logger: Arc<Logger>,
    metrics: Arc<Metrics>,
}

impl GatewayHandler {
    pub fn from_profile(
        profile: &ProfileConfig,
        global: &GlobalConfig,
        pool: Arc<Pool>,
        geodb: Option<&Arc<GeoDb>>,
        logger: Arc<Logger>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut trusted_proxies = Vec::with_capacity(global.trusted_proxies.len());
        for cidr in &global.trusted_proxies {
            trusted_proxies.push(
                parse_cidr_or_ip(cidr)
                    .with_context(|| format!("invalid trusted proxy: {}", cidr))?,
            );
        }

        let allow = profile
            .rules
            .allow
            .as_ref()
            .map(|g| build_group(g, geodb));
        let deny = profile.rules.deny.as_ref().map(|g| build_group(g, geodb));

        Ok(Self {
            profile_id: profile.id.clone(),
            engine: Engine::new(allow, deny),
            pool,
            decoy: Decoy::from_config(&profile.decoy),
            trusted_proxies,
            max_request_body: global
                .max_request_body
                .unwrap_or(DEFAULT_MAX_REQUEST_BODY) as usize,
            max_retries: profile.max_retries.unwrap_or(1) as usize,
            logger,
            metrics,
        })
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub async fn handle(
        &self,
        req: Request<Body>,
        peer: SocketAddr,
        tls: Option<TlsSnapshot>,
    ) -> Response {
        let start = Instant::now();
        let timestamp = Utc::now();
        let (mut parts, body) = req.into_parts();

        // Preserve the client's request ID byte-for-byte, or mint one
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        // Stamp the outgoing headers so backends see the same correlation ID
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            parts.headers.insert(REQUEST_ID_HEADER, value);
        }

        let client_ip = self.extract_client_ip(&parts.headers, peer);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let ctx = Context {
            client_ip: client_ip.clone(),
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            headers: parts.headers.clone(),
            tls: tls.clone(),
            request_id: request_id.clone(),
        };

        let decision = self.engine.evaluate(&ctx);
        debug!(
            profile = %self.profile_id,
            client_ip = %client_ip,
            action = decision.action.as_str(),
            reason = %decision.reason,
            "request classified"
        );

        let mut response = match decision.action {
            Action::AllowForward => self.forward(&parts, body).await,
            Action::DenyDecoy => self.decoy.serve().await,
            Action::Drop => {
                // dropped connections leave no record
                return Decoy::Drop.serve().await;
            }
            Action::Redirect => match decision.redirect_url.as_deref() {
                Some(url) => Decoy::redirect(url).serve().await,
                None => GatewayError::Internal("redirect without target".into()).into_response(),
            },
            Action::Tarpit => {
                Decoy::tarpit(TARPIT_MIN, TARPIT_MAX, self.decoy.clone())
                    .serve()
                    .await
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let duration_ms = (start.elapsed().as_micros() as f64) / 1000.0;

        self.metrics
            .record_request(&self.profile_id, &client_ip, decision.action.as_str(), duration_ms);
        for label in &decision.labels {
            self.metrics.record_rule_hit(label);
        }

        self.logger
            .log_request(&RequestRecord {
                timestamp,
                request_id,
                profile_id: self.profile_id.clone(),
                client_ip,
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                user_agent,
                action: decision.action.as_str().to_string(),
                reason: decision.reason,
                labels: decision.labels,
                status_code: response.status().as_u16(),
                duration_ms,
                tls_version: tls.as_ref().map(|t| format_tls_version(t.version)),
                sni: tls.and_then(|t| t.sni),
            })
            .await;

        response
    }

    async fn forward(&self, parts: &axum::http::request::Parts, body: Body) -> Response {
        // The cap applies to the raw stream; exceeding it fails the request
        let body_bytes = match axum::body::to_bytes(body, self.max_request_body).await {
            Ok(bytes) => bytes,
            Err(_) => return GatewayError::PayloadTooLarge.into_response(),
        };

        let upstream_start = Instant::now();
        let (response, backend) = self
            .pool
            .serve_with_retry(parts, body_bytes, self.max_retries)
            .await;

        if let Some(backend) = backend {
            self.metrics.record_backend_request(
                backend.name(),
                upstream_start.elapsed().as_micros() as u64,
                response.status().as_u16() >= 500,
            );
        }

        response
    }

    /// Resolve the client address. Forwarding headers are honored only when
    /// no trusted proxies are configured (legacy mode, for deployments whose
    /// edge is otherwise unreachable) or when the transport peer is one of
    /// them.
    pub(crate) fn extract_client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> String {
        let direct_ip = peer.ip();

        let forwarded = || {
            if let Some(xff) = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
            {
                if let Some(first) = xff.split(',').next() {
                    return Some(first.trim().to_string());
                }
            }
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        if self.trusted_proxies.is_empty() {
            return forwarded().unwrap_or_else(|| direct_ip.to_string());
        }

        let trusted = self
            .trusted_proxies
            .iter()
            .any(|net| net.contains(&direct_ip));

        if trusted {
            if let Some(ip) = forwarded() {
                return ip;
            }
        }

        direct_ip.to_string()
    }
}

fn format_tls_version(version: u16) -> String {
    match version {
        0x0301 => "1.0".to_string(),
        0x0302 => "1.1".to_string(),
        0x0303 => "1.2".to_string(),
        0x0304 => "1.3".to_string(),
        other => format!("0x{:04x}", other),
    }
}

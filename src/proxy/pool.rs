use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::debug;

use super::backend::{Backend, HealthStatus};
use super::circuit_breaker::CircuitBreakerStats;

/// An ordered set of backends sharing a monotonic round-robin cursor.
/// Membership changes are rare; selection reads a snapshot of the list.
pub struct Pool {
    backends: RwLock<Vec<Arc<Backend>>>,
    cursor: AtomicU64,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add(&self, backend: Arc<Backend>) {
        self.backends
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.snapshot().iter().find(|b| b.name() == name).cloned()
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.snapshot()
    }

    pub fn healthy_count(&self) -> usize {
        self.snapshot().iter().filter(|b| b.is_healthy()).count()
    }

    /// Round-robin over all backends, ignoring health
    pub fn next(&self) -> Option<Arc<Backend>> {
        let backends = self.snapshot();
        if backends.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        Some(backends[idx % backends.len()].clone())
    }

    /// Round-robin over healthy backends. When none are healthy, returns the
    /// backend at the cursor position anyway rather than failing the request.
    pub fn next_healthy(&self) -> Option<Arc<Backend>> {
        let backends = self.snapshot();
        if backends.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        for i in 0..backends.len() {
            let b = &backends[(start + i) % backends.len()];
            if b.is_healthy() {
                return Some(b.clone());
            }
        }

        // degraded fallback
        Some(backends[start % backends.len()].clone())
    }

    /// Weight-proportional selection among healthy backends, using the
    /// cursor as a uniform selector. Falls back to round-robin when no
    /// healthy backend exists or total weight is zero.
    pub fn next_weighted(&self) -> Option<Arc<Backend>> {
        let backends = self.snapshot();
        if backends.is_empty() {
            return None;
        }

        let total_weight: u64 = backends
            .iter()
            .filter(|b| b.is_healthy())
            .map(|b| u64::from(b.weight()))
            .sum();

        if total_weight == 0 {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
            return Some(backends[idx % backends.len()].clone());
        }

        let counter = self.cursor.fetch_add(1, Ordering::Relaxed);
        let target = counter % total_weight;

        let mut cumulative = 0u64;
        for b in &backends {
            if !b.is_healthy() {
                continue;
            }
            cumulative += u64::from(b.weight());
            if target < cumulative {
                return Some(b.clone());
            }
        }

        Some(backends[0].clone())
    }

    /// Dispatch with failover: try healthy, circuit-admitting, untried
    /// backends first, then any untried backend. A 5xx answer is discarded
    /// and the next candidate tried while attempts remain; responses are
    /// buffered, so nothing reaches the wire until the final one is chosen.
    pub async fn serve_with_retry(
        &self,
        parts: &Parts,
        body: Bytes,
        max_retries: usize,
    ) -> (Response, Option<Arc<Backend>>) {
        let backends = self.snapshot();
        if backends.is_empty() {
            return (StatusCode::BAD_GATEWAY.into_response(), None);
        }

        let max_retries = max_retries.clamp(1, backends.len());
        let mut tried: HashSet<String> = HashSet::with_capacity(max_retries);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;

        for attempt in 0..max_retries {
            let scan = |filtered: bool| -> Option<Arc<Backend>> {
                for i in 0..backends.len() {
                    let b = &backends[(start + attempt + i) % backends.len()];
                    if tried.contains(b.name()) {
                        continue;
                    }
                    if filtered && !(b.is_healthy() && b.circuit_allow()) {
                        continue;
                    }
                    return Some(b.clone());
                }
                None
            };

            let backend = match scan(true).or_else(|| scan(false)) {
                Some(b) => b,
                None => break, // all backends tried
            };

            tried.insert(backend.name().to_string());

            let response = backend.dispatch(parts, body.clone()).await;
            let status = response.status().as_u16();

            if status < 500 || attempt == max_retries - 1 {
                return (response, Some(backend));
            }

            debug!(
                "backend {} answered {}, retrying on next candidate",
                backend.name(),
                status
            );
        }

        (StatusCode::BAD_GATEWAY.into_response(), None)
    }

    pub fn health_statuses(&self) -> HashMap<String, HealthStatus> {
        self.snapshot()
            .iter()
            .map(|b| (b.name().to_string(), b.health_status()))
            .collect()
    }

    pub fn circuit_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.snapshot()
            .iter()
            .map(|b| (b.name().to_string(), b.circuit_stats()))
            .collect()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

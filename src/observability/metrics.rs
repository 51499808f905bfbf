use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

/// Unique client IPs tracked before the set is reset to bound memory
const UNIQUE_IP_CAP: usize = 100_000;

#[derive(Debug, Default, Clone)]
struct BackendStat {
    requests: u64,
    errors: u64,
    total_latency_us: u64,
    min_latency_us: u64,
    max_latency_us: u64,
}

/// Central metrics store. Scalar counters are atomics; keyed counters live
/// in concurrent maps and are snapshotted for the admin API.
pub struct Metrics {
    start: Instant,

    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    denied_requests: AtomicU64,
    dropped_requests: AtomicU64,

    total_response_us: AtomicU64,
    response_count: AtomicU64,

    profile_requests: DashMap<String, u64>,
    decisions: DashMap<String, u64>,
    rule_hits: DashMap<String, u64>,
    backend_stats: DashMap<String, BackendStat>,

    unique_ips: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
}

/// Point-in-time metrics snapshot served by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub uptime: String,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub dropped_requests: u64,
    pub unique_ips: usize,
    pub avg_response_ms: f64,
    pub requests_per_sec: f64,
    pub profile_requests: HashMap<String, u64>,
    pub decisions: HashMap<String, u64>,
    pub rule_hits: HashMap<String, u64>,
    pub backend_stats: HashMap<String, BackendStatsSnapshot>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            total_requests: AtomicU64::new(0),
            allowed_requests: AtomicU64::new(0),
            denied_requests: AtomicU64::new(0),
            dropped_requests: AtomicU64::new(0),
            total_response_us: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            profile_requests: DashMap::new(),
            decisions: DashMap::new(),
            rule_hits: DashMap::new(),
            backend_stats: DashMap::new(),
            unique_ips: Mutex::new(HashSet::new()),
        }
    }

    pub fn record_request(&self, profile_id: &str, client_ip: &str, action: &str, duration_ms: f64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match action {
            "allow_forward" => {
                self.allowed_requests.fetch_add(1, Ordering::Relaxed);
            }
            "deny_decoy" => {
                self.denied_requests.fetch_add(1, Ordering::Relaxed);
            }
            "drop" => {
                self.dropped_requests.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        *self.profile_requests.entry(profile_id.to_string()).or_insert(0) += 1;
        *self.decisions.entry(action.to_string()).or_insert(0) += 1;

        {
            let mut ips = self.unique_ips.lock().unwrap_or_else(|e| e.into_inner());
            if ips.len() >= UNIQUE_IP_CAP {
                ips.clear();
            }
            ips.insert(client_ip.to_string());
        }

        self.total_response_us
            .fetch_add((duration_ms * 1000.0) as u64, Ordering::Relaxed);
        self.response_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rule_hit(&self, rule_tag: &str) {
        *self.rule_hits.entry(rule_tag.to_string()).or_insert(0) += 1;
    }

    pub fn record_backend_request(&self, backend: &str, latency_us: u64, is_error: bool) {
        let mut stat = self
            .backend_stats
            .entry(backend.to_string())
            .or_insert_with(|| BackendStat {
                min_latency_us: latency_us,
                max_latency_us: latency_us,
                ..BackendStat::default()
            });

        stat.requests += 1;
        stat.total_latency_us += latency_us;
        if is_error {
            stat.errors += 1;
        }
        if latency_us < stat.min_latency_us || stat.min_latency_us == 0 {
            stat.min_latency_us = latency_us;
        }
        if latency_us > stat.max_latency_us {
            stat.max_latency_us = latency_us;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let uptime = self.start.elapsed();
        let total = self.total_requests.load(Ordering::Relaxed);
        let response_count = self.response_count.load(Ordering::Relaxed);
        let response_us = self.total_response_us.load(Ordering::Relaxed);

        let avg_response_ms = if response_count > 0 {
            response_us as f64 / response_count as f64 / 1000.0
        } else {
            0.0
        };

        let requests_per_sec = if uptime.as_secs_f64() > 0.0 {
            total as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        let backend_stats = self
            .backend_stats
            .iter()
            .map(|entry| {
                let stat = entry.value();
                let error_rate = if stat.requests > 0 {
                    stat.errors as f64 / stat.requests as f64 * 100.0
                } else {
                    0.0
                };
                let avg_latency_ms = if stat.requests > 0 {
                    stat.total_latency_us as f64 / stat.requests as f64 / 1000.0
                } else {
                    0.0
                };
                (
                    entry.key().clone(),
                    BackendStatsSnapshot {
                        requests: stat.requests,
                        errors: stat.errors,
                        error_rate,
                        avg_latency_ms,
                        min_latency_ms: stat.min_latency_us as f64 / 1000.0,
                        max_latency_ms: stat.max_latency_us as f64 / 1000.0,
                    },
                )
            })
            .collect();

        Snapshot {
            uptime: format!("{}s", uptime.as_secs()),
            total_requests: total,
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            denied_requests: self.denied_requests.load(Ordering::Relaxed),
            dropped_requests: self.dropped_requests.load(Ordering::Relaxed),
            unique_ips: self
                .unique_ips
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            avg_response_ms,
            requests_per_sec,
            profile_requests: copy_map(&self.profile_requests),
            decisions: copy_map(&self.decisions),
            rule_hits: copy_map(&self.rule_hits),
            backend_stats,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn copy_map(map: &DashMap<String, u64>) -> HashMap<String, u64> {
    map.iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_counts() {
        let metrics = Metrics::new();

        metrics.record_request("web", "10.0.0.1", "allow_forward", 1.5);
        metrics.record_request("web", "10.0.0.2", "deny_decoy", 0.5);
        metrics.record_request("api", "10.0.0.1", "drop", 0.1);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.allowed_requests, 1);
        assert_eq!(snap.denied_requests, 1);
        assert_eq!(snap.dropped_requests, 1);
        assert_eq!(snap.unique_ips, 2);
        assert_eq!(snap.profile_requests.get("web"), Some(&2));
        assert_eq!(snap.profile_requests.get("api"), Some(&1));
        assert_eq!(snap.decisions.get("allow_forward"), Some(&1));
    }

    #[test]
    fn test_avg_response_time() {
        let metrics = Metrics::new();
        metrics.record_request("web", "10.0.0.1", "allow_forward", 2.0);
        metrics.record_request("web", "10.0.0.1", "allow_forward", 4.0);

        let snap = metrics.snapshot();
        assert!((snap.avg_response_ms - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_rule_hits() {
        let metrics = Metrics::new();
        metrics.record_rule_hit("ip_allow");
        metrics.record_rule_hit("ip_allow");
        metrics.record_rule_hit("rate-exceeded");

        let snap = metrics.snapshot();
        assert_eq!(snap.rule_hits.get("ip_allow"), Some(&2));
        assert_eq!(snap.rule_hits.get("rate-exceeded"), Some(&1));
    }

    #[test]
    fn test_backend_stats() {
        let metrics = Metrics::new();
        metrics.record_backend_request("primary", 2000, false);
        metrics.record_backend_request("primary", 4000, true);

        let snap = metrics.snapshot();
        let stats = snap.backend_stats.get("primary").unwrap();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.errors, 1);
        assert!((stats.error_rate - 50.0).abs() < 0.01);
        assert!((stats.avg_latency_ms - 3.0).abs() < 0.01);
        assert!((stats.min_latency_ms - 2.0).abs() < 0.01);
        assert!((stats.max_latency_ms - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.avg_response_ms, 0.0);
        assert!(snap.backend_stats.is_empty());
    }
}

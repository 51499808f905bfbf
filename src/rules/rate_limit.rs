use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use super::{Context, Rule, RuleResult};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    window_end: Instant,
}

type CounterMap = Arc<Mutex<HashMap<String, Counter>>>;

fn lock_counters(counters: &CounterMap) -> MutexGuard<'_, HashMap<String, Counter>> {
    counters.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-client fixed-window rate limit. The counter map is shared with a
/// background sweeper that drops expired entries once a minute.
pub struct RateLimitRule {
    max_requests: u32,
    window: Duration,
    counters: CounterMap,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
}

impl RateLimitRule {
    /// Spawns the sweeper task; must be called within a tokio runtime.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let counters: CounterMap = Arc::new(Mutex::new(HashMap::new()));
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::new(Notify::new());

        let sweeper_counters = counters.clone();
        let sweeper_stopped = stopped.clone();
        let sweeper_signal = stop_signal.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // completes immediately
            loop {
                if sweeper_stopped.load(Ordering::Acquire) {
                    return;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let mut counters = lock_counters(&sweeper_counters);
                        let before = counters.len();
                        counters.retain(|_, c| c.window_end > now);
                        let removed = before - counters.len();
                        if removed > 0 {
                            debug!("rate limit sweeper removed {} expired entries", removed);
                        }
                    }
                    _ = sweeper_signal.notified() => return,
                }
            }
        });

        Self {
            max_requests,
            window,
            counters,
            stopped,
            stop_signal,
        }
    }

    /// Stop the background sweeper. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.stop_signal.notify_one();
        }
    }

    /// Current per-client counts, for status reporting
    pub fn stats(&self) -> HashMap<String, u32> {
        lock_counters(&self.counters)
            .iter()
            .map(|(ip, c)| (ip.clone(), c.count))
            .collect()
    }
}

impl Drop for RateLimitRule {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Rule for RateLimitRule {
    fn evaluate(&self, ctx: &Context) -> RuleResult {
        let now = Instant::now();
        let mut counters = lock_counters(&self.counters);

        // read + increment + possible insert form one critical section
        let in_window = match counters.get_mut(&ctx.client_ip) {
            Some(c) if now < c.window_end => {
                c.count += 1;
                Some(c.count)
            }
            _ => None,
        };

        let count = match in_window {
            Some(count) => count,
            None => {
                // Absent or expired: start a new window
                counters.insert(
                    ctx.client_ip.clone(),
                    Counter {
                        count: 1,
                        window_end: now + self.window,
                    },
                );
                1
            }
        };

        if count > self.max_requests {
            RuleResult {
                matched: false,
                reason: format!(
                    "rate limit exceeded: {}/{} requests in window",
                    count, self.max_requests
                ),
                labels: vec!["rate-exceeded".to_string()],
            }
        } else {
            RuleResult {
                matched: true,
                reason: format!("rate limit: {}/{} requests", count, self.max_requests),
                labels: vec!["rate-ok".to_string()],
            }
        }
    }

    fn type_tag(&self) -> &'static str {
        "rate_limit"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_ip(ip: &str) -> Context {
        Context {
            client_ip: ip.to_string(),
            ..Context::default()
        }
    }

    #[tokio::test]
    async fn test_first_n_requests_match() {
        let rule = RateLimitRule::new(3, Duration::from_secs(60));
        let ctx = ctx_with_ip("10.0.0.1");

        for i in 1..=3 {
            let result = rule.evaluate(&ctx);
            assert!(result.matched, "request #{} should match", i);
            assert_eq!(result.labels, vec!["rate-ok".to_string()]);
        }

        let result = rule.evaluate(&ctx);
        assert!(!result.matched, "request #4 should not match");
        assert_eq!(result.labels, vec!["rate-exceeded".to_string()]);
    }

    #[tokio::test]
    async fn test_clients_counted_independently() {
        let rule = RateLimitRule::new(3, Duration::from_secs(60));

        for _ in 0..4 {
            rule.evaluate(&ctx_with_ip("10.0.0.1"));
        }
        // a different client in the same window still matches
        assert!(rule.evaluate(&ctx_with_ip("10.0.0.2")).matched);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_counter() {
        let rule = RateLimitRule::new(1, Duration::from_millis(30));
        let ctx = ctx_with_ip("10.0.0.1");

        assert!(rule.evaluate(&ctx).matched);
        assert!(!rule.evaluate(&ctx).matched);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = rule.evaluate(&ctx);
        assert!(result.matched, "new window should reset the counter");
        assert!(result.reason.starts_with("rate limit: 1/"));
    }

    #[tokio::test]
    async fn test_stats() {
        let rule = RateLimitRule::new(10, Duration::from_secs(60));

        rule.evaluate(&ctx_with_ip("10.0.0.1"));
        rule.evaluate(&ctx_with_ip("10.0.0.1"));
        rule.evaluate(&ctx_with_ip("10.0.0.2"));

        let stats = rule.stats();
        assert_eq!(stats.get("10.0.0.1"), Some(&2));
        assert_eq!(stats.get("10.0.0.2"), Some(&1));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let rule = RateLimitRule::new(10, Duration::from_secs(60));

        rule.stop();
        rule.stop(); // second stop is a no-op

        // evaluation still works after stop, just without sweeping
        assert!(rule.evaluate(&ctx_with_ip("10.0.0.1")).matched);
    }

    #[tokio::test]
    async fn test_type_tag() {
        let rule = RateLimitRule::new(10, Duration::from_secs(60));
        assert_eq!(rule.type_tag(), "rate_limit");
    }
}

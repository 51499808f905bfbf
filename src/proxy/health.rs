use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::backend::Backend;
use super::pool::Pool;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Used when a backend has no health_check_path of its own
    pub default_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
            default_path: "/".to_string(),
        }
    }
}

struct ProberState {
    running: bool,
    task: Option<JoinHandle<()>>,
}

/// Periodic HTTP health prober for a pool. Probes all backends once at
/// start, then every `interval`. The prober and the circuit breakers signal
/// independently.
pub struct HealthProber {
    pool: Arc<Pool>,
    config: HealthConfig,
    client: reqwest::Client,
    state: Mutex<ProberState>,
    stop_signal: Arc<Notify>,
}

impl HealthProber {
    pub fn new(pool: Arc<Pool>, config: HealthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client for health checks: {}", e))?;

        Ok(Self {
            pool,
            config,
            client,
            state: Mutex::new(ProberState {
                running: false,
                task: None,
            }),
            stop_signal: Arc::new(Notify::new()),
        })
    }

    pub fn start(&self) {
        if !self.config.enabled {
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running {
            return;
        }
        state.running = true;

        let pool = self.pool.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let stop_signal = self.stop_signal.clone();

        state.task = Some(tokio::spawn(async move {
            // immediate probe, then on the interval
            check_all(&pool, &client, &config).await;

            let mut interval = tokio::time::interval(config.interval);
            interval.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => check_all(&pool, &client, &config).await,
                    _ = stop_signal.notified() => return,
                }
            }
        }));
    }

    /// Idempotent; aborts any in-flight probe.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.running {
            return;
        }
        state.running = false;
        self.stop_signal.notify_one();
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn check_all(pool: &Pool, client: &reqwest::Client, config: &HealthConfig) {
    for backend in pool.backends() {
        let healthy = check(client, config, &backend).await;
        if healthy != backend.is_healthy() {
            if healthy {
                debug!("backend {} became healthy", backend.name());
            } else {
                warn!("backend {} became unhealthy", backend.name());
            }
        }
        backend.set_healthy(healthy);
    }
}

async fn check(client: &reqwest::Client, config: &HealthConfig, backend: &Backend) -> bool {
    let path = if backend.health_check_path().is_empty() {
        &config.default_path
    } else {
        backend.health_check_path()
    };

    let mut url = backend.url().clone();
    url.set_path(path);
    url.set_query(None);

    match client.get(url).send().await {
        // 2xx and 3xx count as healthy
        Ok(resp) => {
            let status = resp.status().as_u16();
            (200..400).contains(&status)
        }
        Err(_) => false,
    }
}

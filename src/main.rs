use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod config;
mod decision;
mod decoy;
mod error;
mod gateway;
mod geoip;
mod listener;
mod observability;
mod proxy;
mod rules;

use config::Config;
use gateway::GatewayHandler;
use geoip::GeoDb;
use listener::Listener;
use observability::{Logger, Metrics};
use proxy::{Backend, BackendOptions, HealthConfig, HealthProber, Pool};

const ADMIN_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "veilgate", version)]
#[command(about = "Stealth reverse proxy and deception gateway")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = Config::load(&args.config)
        .await
        .with_context(|| format!("loading configuration from {}", args.config))?;

    if args.validate {
        println!("Configuration is valid");
        return Ok(());
    }

    init_tracing(&cfg);

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        // a provider was already installed, which is fine
        warn!("rustls crypto provider was already installed");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        profiles = cfg.profiles.len(),
        "veilgate starting"
    );

    let logger = Arc::new(
        Logger::open(&cfg.global.log.output)
            .await
            .context("initializing request logger")?,
    );
    let metrics = Arc::new(Metrics::new());

    let geodb = match cfg.global.geoip_db_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => match GeoDb::open(path) {
            Ok(db) => {
                info!(path, "GeoIP database loaded");
                Some(Arc::new(db))
            }
            Err(e) => {
                warn!("failed to load GeoIP database: {:#}", e);
                None
            }
        },
        None => None,
    };

    let mut pools: HashMap<String, Arc<Pool>> = HashMap::new();
    let mut probers: Vec<Arc<HealthProber>> = Vec::new();
    let mut listeners: Vec<Arc<Listener>> = Vec::new();

    for profile in &cfg.profiles {
        let pool = Arc::new(Pool::new());
        for bc in &profile.backends {
            let opts = BackendOptions {
                health_check_path: bc
                    .health_check_path
                    .clone()
                    .unwrap_or_else(|| "/".to_string()),
                timeout: bc.timeout.unwrap_or(Duration::from_secs(30)),
                ..BackendOptions::default()
            };
            let weight = if bc.weight == 0 { 1 } else { bc.weight };
            match Backend::with_options(&bc.name, &bc.url, weight, opts) {
                Ok(backend) => pool.add(Arc::new(backend)),
                Err(e) => {
                    error!(
                        profile = %profile.id,
                        backend = %bc.name,
                        "failed to create backend: {:#}",
                        e
                    );
                }
            }
        }

        let handler = Arc::new(
            GatewayHandler::from_profile(
                profile,
                &cfg.global,
                pool.clone(),
                geodb.as_ref(),
                logger.clone(),
                metrics.clone(),
            )
            .with_context(|| format!("building handler for profile {}", profile.id))?,
        );

        for lc in &profile.listeners {
            let protocol = lc.protocol.to_lowercase();
            if protocol == "tcp" {
                warn!(
                    profile = %profile.id,
                    addr = %lc.addr,
                    "raw tcp listeners are not served by the HTTP gateway; skipping"
                );
                continue;
            }

            let tls = if protocol == "https" {
                let tls_files = lc
                    .tls
                    .as_ref()
                    .context("https listener without TLS material")?;
                Some(listener::load_tls_config(
                    &tls_files.cert_file,
                    &tls_files.key_file,
                )?)
            } else {
                None
            };

            let l = listener::bind_and_start(&lc.addr, tls, handler.clone())
                .await
                .with_context(|| format!("starting listener {}", lc.addr))?;
            listeners.push(l);
        }

        let prober = Arc::new(
            HealthProber::new(pool.clone(), HealthConfig::default())
                .with_context(|| format!("creating health prober for profile {}", profile.id))?,
        );
        prober.start();
        probers.push(prober);
        info!(profile = %profile.id, "health prober started");

        pools.insert(profile.id.clone(), pool);
    }

    // Admin API
    let admin_stop = Arc::new(Notify::new());
    let mut admin_task = None;
    if let Some(addr) = cfg
        .global
        .metrics_addr
        .as_deref()
        .filter(|a| !a.is_empty())
    {
        let state = admin::AdminState::new(admin::AdminConfig {
            metrics: metrics.clone(),
            pools: pools.clone(),
            listeners: listeners.clone(),
            config_path: Some(args.config.clone()),
            auth_token: cfg.global.admin_api.token.clone(),
            allowed_ips: cfg.global.admin_api.allowed_ips.clone(),
        });

        let socket = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding admin API to {}", addr))?;
        info!(addr, "admin API started");

        let stop = admin_stop.clone();
        let app = admin::router(state);
        admin_task = Some(tokio::spawn(async move {
            let serve = axum::serve(
                socket,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop.notified().await });
            if let Err(e) = serve.await {
                error!("admin API error: {}", e);
            }
        }));
    }

    info!(profiles = cfg.profiles.len(), "veilgate started");

    wait_for_shutdown(&args.config).await;

    // Ordered shutdown: probers, then admin, then listener drain
    info!("shutting down");

    for prober in &probers {
        prober.stop();
    }

    if let Some(task) = admin_task {
        admin_stop.notify_one();
        if tokio::time::timeout(ADMIN_SHUTDOWN_BUDGET, task).await.is_err() {
            warn!("admin API did not stop within budget");
        }
    }

    let drain_timeout = cfg
        .global
        .shutdown_timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

    let mut drains = Vec::with_capacity(listeners.len());
    for l in listeners {
        drains.push(tokio::spawn(async move { l.shutdown(drain_timeout).await }));
    }
    for drain in drains {
        let _ = drain.await;
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.global.log.level));

    let registry = tracing_subscriber::registry().with(filter);
    if cfg.global.log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Block until SIGINT/SIGTERM. SIGHUP re-validates the configuration from
/// disk and logs the outcome; applying changes requires a restart.
async fn wait_for_shutdown(config_path: &str) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register SIGINT handler: {}", e);
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register SIGTERM handler: {}", e);
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to register SIGHUP handler: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, validating configuration");
                match Config::load(config_path).await {
                    Ok(cfg) => info!(
                        profiles = cfg.profiles.len(),
                        "configuration valid; restart required for changes to take effect"
                    ),
                    Err(e) => error!("configuration validation failed: {:#}", e),
                }
            }
        }
    }
}

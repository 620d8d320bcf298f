//! # Traffic Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. Load and validate configuration (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`)
//! 2. Install logging and, when enabled, the Prometheus recorder
//! 3. Connect the rate-limit store and build the gateway
//! 4. Start background health probes and rate-limit cleanup
//! 5. Serve the proxy and admin listeners until SIGINT or SIGTERM

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use traffic_gateway::admin::{admin_router, AdminState};
use traffic_gateway::gateway::{gateway_router, serve};
use traffic_gateway::load_balancing::HealthChecker;
use traffic_gateway::observability::metrics::GatewayMetrics;
use traffic_gateway::observability::{init_logging, NoopMetrics, PrometheusMetrics};
use traffic_gateway::rate_limiting::{build_store, RateLimitCleanupTask, SlidingWindowRateLimiter};
use traffic_gateway::{Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load().await.context("Failed to load gateway configuration")?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!("Starting traffic gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let prometheus = if config.metrics.prometheus_enabled {
        Some(PrometheusMetrics::install_recorder()?)
    } else {
        None
    };
    let metrics: Arc<dyn GatewayMetrics> = if prometheus.is_some() {
        Arc::new(PrometheusMetrics::new())
    } else {
        Arc::new(NoopMetrics)
    };

    let limiter = if config.rate_limit.enabled {
        let store = build_store(&config.rate_limit.storage)
            .await
            .context("Failed to connect rate limit store")?;
        info!(store = store.name(), "Rate limit store ready");
        Some(Arc::new(SlidingWindowRateLimiter::new(
            config.rate_limit.clone(),
            store,
            metrics.clone(),
        )))
    } else {
        warn!("Rate limiting disabled");
        None
    };

    let gateway = Arc::new(Gateway::from_config(&config, limiter.clone(), metrics)?);
    info!(services = config.services.len(), "Gateway built from configuration");

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    let mut health = HealthChecker::new();
    for (name, service) in &config.services {
        health.add_pool(gateway.pool(name)?, service.health_check.clone());
    }
    if !health.is_empty() {
        background.push(Arc::new(health).spawn(shutdown.clone()));
    }

    if let Some(limiter) = &limiter {
        background.push(RateLimitCleanupTask::spawn(
            limiter.clone(),
            config.rate_limit.cleanup_interval,
            shutdown.clone(),
        ));
    }

    let mut admin_app = admin_router(AdminState::new(gateway.clone()));
    if let Some(handle) = prometheus {
        admin_app = admin_app.route("/metrics", get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }));
    }
    let gateway_app = gateway_router(gateway, &config.server);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let served = serve(&config.server, gateway_app, admin_app, shutdown.clone()).await;
    shutdown.cancel();

    for task in background {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    served?;
    info!("Traffic gateway shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

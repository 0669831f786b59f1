//! Specificproxy - Entry Point
//!
//! Starts the proxy server and the rate limiter sweeper with graceful
//! shutdown support.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use specificproxy::config::{Config, EgressConfig, LogConfig};
use specificproxy::interfaces::{EgressPolicy, InterfacePolicy};
use specificproxy::proxy::{api, EgressSelector, ProxyHandler, ProxyHandlerConfig, ProxyServer};
use specificproxy::ratelimit::RateLimiterStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_tracing(&config.log);

    info!("Starting specificproxy");

    let egress_config = EgressConfig::from_file(&config.config_path)
        .with_context(|| format!("failed to load {}", config.config_path))?;
    let policy: Arc<dyn EgressPolicy> = Arc::new(InterfacePolicy::new(&egress_config));

    match policy.available() {
        Ok(addresses) => info!("{} egress IPs available", addresses.len()),
        Err(e) => error!("Egress IPs unavailable at startup: {}", e),
    }

    let store = Arc::new(RateLimiterStore::new(config.rate_limit.sweep_interval()));
    let sweeper_task = store.spawn_sweeper();

    let handler = Arc::new(ProxyHandler::new(
        EgressSelector::new(policy.clone()),
        store.clone(),
        ProxyHandlerConfig {
            connect_timeout: config.proxy.connect_timeout(),
            ..Default::default()
        },
    ));
    let proxy_server = ProxyServer::new(config.proxy.clone(), handler, api::router(policy));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    if config.shutdown_sleep_secs > 0 {
        info!(
            "Waiting {}s before shutting down",
            config.shutdown_sleep_secs
        );
        tokio::time::sleep(Duration::from_secs(config.shutdown_sleep_secs)).await;
    }

    let _ = shutdown_tx.send(true);
    store.stop();

    let _ = tokio::join!(proxy_task, sweeper_task);

    info!("specificproxy stopped");
    Ok(())
}

/// Initialize tracing from `RUST_LOG`, falling back to the configured level
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("specificproxy={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

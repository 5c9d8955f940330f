//! Bridge-Me-Not Resolver - off-chain coordination for two-chain hashlock swaps
//!
//! This resolver watches the escrow factory and limit order protocol on every
//! configured chain, keeps a durable ledger of swaps and their secrets, and drives
//! each swap through destination escrow creation, secret reveal and withdrawal.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

mod api;
mod chain;
mod codec;
mod config;
mod coordination;
mod error;
mod events;
mod ledger;
mod metrics;
mod retry;
mod store;
mod tx;
mod vault;

use chain::ChainManager;
use config::Settings;
use coordination::CoordinationEngine;
use ledger::SwapLedger;
use metrics::MetricsServer;
use tx::DryRunSubmitter;
use vault::SecretVault;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Bridge-Me-Not Resolver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.resolver.instance_id
    );

    // Open the durable store
    let store = store::open(&settings.store).await?;
    info!("Store opened");

    let ledger = Arc::new(SwapLedger::new(store.clone()));
    let vault = Arc::new(SecretVault::new(store.clone()));

    // Initialize chain manager (handles all chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings, store.clone()).await?);
    info!("Chain connections initialized");

    // Initialize coordination engine
    let engine = Arc::new(CoordinationEngine::new(
        ledger,
        vault,
        Arc::new(DryRunSubmitter),
        chain_manager.finality_trackers(),
        settings.resolver.clone(),
    ));
    warn!("No transaction signer configured, actions are logged but not submitted");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start chain watchers, all feeding the engine
    let (event_tx, event_rx) = mpsc::channel(settings.resolver.event_buffer);
    chain_manager.start_watchers(event_tx);

    // Start coordination engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(event_rx).await }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            engine: engine.clone(),
            chain_manager: chain_manager.clone(),
            store: store.clone(),
        };
        let shutdown = shutdown_requested(shutdown_rx.clone());
        async move {
            if let Err(e) = api::run_server(config, state, shutdown).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown_requested(shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let interval = settings.resolver.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                // Check chain connections
                let health = chain_manager.health_check().await;
                let mut healthy = health.iter().all(|(_, ok)| *ok);

                // Check store connection
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Bridge-Me-Not Resolver is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Stop producers first, then let the engine finish what it is doing
    chain_manager.stop().await;
    engine.stop();
    if let Err(e) = engine_handle.await {
        error!("Coordination engine task failed: {}", e);
    }

    shutdown_tx.send_replace(true);
    health_handle.abort();
    if let Err(e) = api_handle.await {
        error!("API server task failed: {}", e);
    }
    if let Some(h) = metrics_handle {
        if let Err(e) = h.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    // Every writer has stopped
    store.close().await;

    info!("Bridge-Me-Not Resolver stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_me_not_resolver=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Resolves once shutdown has been requested on `rx`
fn shutdown_requested(
    mut rx: watch::Receiver<bool>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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

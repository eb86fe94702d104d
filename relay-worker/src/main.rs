//! Hookwire - webhook delivery worker pool and admin API.
//!
//! Loads configuration from the environment, opens the stores, verifies the
//! audit chain, then runs the delivery workers alongside the admin HTTP API
//! until SIGINT/SIGTERM. In-flight sends are allowed to finish on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hookwire::web::{router, AppState};
use hookwire::{Config, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("hookwire_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        concurrency = config.worker_concurrency,
        request_timeout_ms = config.request_timeout_ms,
        retry_base_delay_ms = config.retry_base_delay_ms,
        retry_jitter_ms = config.retry_jitter_ms,
        max_attempts = config.max_attempts,
        lease_ttl_ms = config.lease_ttl_ms,
        data_dir = ?config.data_dir,
        allow_insecure_urls = config.allow_insecure_urls,
        throttle_per_host_rps = ?config.throttle_per_host_rps,
        "config_loaded"
    );

    let relay = Relay::new(config.clone()).context("Failed to open relay stores")?;

    // A broken chain means the history can't be trusted; refuse to run on top of it.
    if let Err(e) = relay.verify_audit_chain() {
        error!(error = %e, "audit_chain_untrusted");
        return Err(e).context("Audit chain failed verification");
    }

    let relay = Arc::new(relay);
    let pool = relay.start_workers();

    let app = router(AppState::new(Arc::clone(&relay)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.shutdown().await;

    info!("hookwire_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "ctrl_c_handler_failed");
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
                error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("hookwire_shutting_down");
}

//! SnapDuel Server
//!
//! Binary entry point: loads configuration from the environment, wires
//! the engine around one shared store, spawns the periodic sweeps, and
//! serves the HTTP surface until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::time::interval;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapduel::network::{router, App};
use snapduel::settle::DevTreasury;
use snapduel::{Config, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Arc::new(Config::from_env());
    info!("SnapDuel Server v{}", VERSION);
    info!("Binding {}", config.bind_addr);
    info!(
        "Stake cap {} micros, fee {}bps, queue ttl {}s, claim window {}s",
        config.stake_cap_micros, config.fee_bps, config.queue_ttl_secs, config.claim_window_secs
    );
    if !config.auth.is_configured() {
        info!("WARNING: no AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; all requests will be rejected");
    }

    let app = App::build(config.clone(), DevTreasury);

    // Periodic sweeps: queue expiry + leftover pairing, duel resolution
    // timeouts, stale-payment expiry and refund retries. All idempotent
    // and safe to run alongside other instances.
    let sweep_app = app.clone();
    let sweep_config = config.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(sweep_config.sweep_interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            sweep_app.queue.sweep_expired(now).await;
            sweep_app.queue.pair_sweep(now).await;
            sweep_app.engine.sweep(now).await;
            sweep_app
                .ledger
                .expire_stale_payments(sweep_config.payment_timeout_minutes, now)
                .await;
            sweep_app.settlement.drive_refunds("refund-worker", now).await;
        }
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, router(app.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutting down");
    sweeper.abort();
    app.shutdown();
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let boot = turnsapi_core::bootstrap::bootstrap_from_env().await?;
    let state = boot.state.clone();

    let retention_days = state.config.log_retention_days;
    let retention_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            turnsapi_core::logger::run_retention_sweep(&retention_state, retention_days).await;
        }
    });

    let bind = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "turnsapi listening");

    let app = turnsapi_core::build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

/// Waits for SIGINT or SIGTERM, then returns so `axum::serve` stops
/// accepting new connections; in-flight requests get up to
/// `SHUTDOWN_GRACE` before the process exits regardless (spec §5).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!(grace_seconds = SHUTDOWN_GRACE.as_secs(), "shutdown signal received");

    // `axum::serve`'s own drain has no deadline once this future resolves, so
    // race it against a hard exit: if in-flight requests (e.g. one stuck on
    // the attempt deadline) haven't finished in SHUTDOWN_GRACE, force-kill
    // the process instead of hanging past the documented bound.
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        tracing::warn!(
            grace_seconds = SHUTDOWN_GRACE.as_secs(),
            "in-flight requests did not drain within the shutdown grace period, forcing exit"
        );
        std::process::exit(1);
    });
}

//! Binary entry point: parse the CLI, build the server config, install
//! logging, bind the listener, and serve until Ctrl+C/SIGTERM or the
//! registry's `--once` shutdown token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use wsty::config::{verbosity_filter, Cli, ServerConfig};
use wsty::registry::SessionRegistry;
use wsty::ws::{upgrade, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        tracing_subscriber::EnvFilter::new(verbosity_filter(cli.verbose))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Arc::new(ServerConfig::from_cli(cli)?);
    let registry = Arc::new(SessionRegistry::new(config.clone()));
    let shutdown = registry.shutdown_token();

    let state = AppState {
        config: config.clone(),
        registry,
    };

    let app = Router::new()
        .route(&state.config.ws_path, get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, path = %config.ws_path, command = %config.command_name(), "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    info!("server shut down");
    Ok(())
}

/// Wait for Ctrl+C, SIGTERM, or the registry's `once`-triggered token,
/// whichever comes first.
async fn shutdown_signal(once_token: tokio_util::sync::CancellationToken) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
        _ = once_token.cancelled() => info!("exiting due to --once"),
    }
}

mod cli;
mod config;
mod handlers;
mod telemetry;
mod websocket;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use signal_core::{RelayRouter, SessionRegistry};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::ServerConfig;
use crate::handlers::{health_check, metrics_handler, stats_handler, AppState};
use crate::telemetry::Telemetry;
use crate::websocket::websocket_handler;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        session,
        offer,
        listen_secs,
    }) = cli.command
    {
        telemetry::init_tracing()?;
        return cli::run_probe(url, session, offer, listen_secs).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        member_cap = config.relay.member_cap,
        idle_expiry_secs = config.relay.idle_session_expiry.as_secs(),
        "starting signal-road"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let registry = SessionRegistry::new(config.relay.clone());
    let recycler_handle = registry.spawn_recycler();
    let state = AppState::new(RelayRouter::new(registry), Some(metrics));

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws/:session_id", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("signal-road listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    recycler_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

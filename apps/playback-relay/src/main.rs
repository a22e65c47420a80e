mod auth;
mod commands;
mod config;
mod engine;
mod error;
mod hub;
mod persistence;
mod poller;
mod protocol;
mod refresh;
mod routes;
mod session;
mod telemetry;
mod upstream;
mod websocket;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use crate::{
    config::{Cli, ServerConfig},
    engine::{Engine, EngineSettings},
    persistence::{RedisPersistence, SessionPersistence},
    routes::{router, AppState},
    upstream::SpotifyUpstream,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        persist = config.persist.is_some(),
        redirect_uri = %config.oauth.redirect_uri,
        "starting playback-relay"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let upstream = SpotifyUpstream::new(config.oauth.clone(), config.http_timeout)
        .context("failed to build upstream client")?;
    let persistence: Option<Arc<dyn SessionPersistence>> = match &config.persist {
        Some(url) => Some(Arc::new(RedisPersistence::connect(url).await?)),
        None => None,
    };

    let engine = Engine::new(Arc::new(upstream), persistence, EngineSettings::default());
    engine.start().await;

    let app = router(AppState {
        engine: engine.clone(),
        metrics: Some(metrics),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(event = "listening", addr = %config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("shutdown signal received");
    engine.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

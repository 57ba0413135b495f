pub mod accounting;
pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod runner;
pub mod sandbox;
pub mod session;
pub mod store;

use std::net::SocketAddr;

use anyhow::Context;
use axum::Router;

use crate::engine::{api::routes, config::EngineConfig, executor::ExecutionEngine};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let bind_addr = config.bind_addr;
    let engine = ExecutionEngine::from_config(config).context("sandbox backend init failed")?;

    let app: Router = routes(engine.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        backend = engine.backend_name(),
        "sandbox execution engine ready"
    );

    // Open event streams keep the server draining until their sessions end,
    // so live sessions are cancelled as soon as the signal arrives.
    let draining = engine.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let live = draining.shutdown().await;
            tracing::info!(sessions = live, "live sessions cancelled");
        })
        .await
        .context("server error");

    let leftover = engine.shutdown().await;
    tracing::info!(sandboxes = leftover, "sandbox execution engine stopped");
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}

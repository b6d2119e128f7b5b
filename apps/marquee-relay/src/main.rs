mod cli;
mod config;
mod error;
mod handlers;
mod hub;
mod protocol;
mod registry;
mod websocket;

use std::sync::Arc;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{get_project_status, health_check, list_projects},
    hub::TopicHub,
    registry::Registry,
    websocket::{websocket_handler, AppState},
};

#[tokio::main]
async fn main() {
    // Default to INFO unless the operator says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Probe { url, code, listen }) = cli.command {
        if let Err(err) = cli::run_probe(url, code, listen).await {
            error!("probe error: {err}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting Marquee relay on port {}", config.port);

    let hub = TopicHub::new();
    let registry = Arc::new(Registry::new(hub.clone()));
    let state = AppState { registry, hub };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/projects", get(list_projects))
        .route("/projects/:name", get(get_project_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("Marquee relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

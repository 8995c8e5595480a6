//! localflare: a single-process local emulator of a serverless edge
//! platform. Workers run inside a sandboxed `rquickjs` runtime
//! (`localflare-runtime`, pooled by `localflare-pool`) with typed bindings
//! (`localflare-bindings`) to local KV, object, relational, queue,
//! durable object, vector, and AI backends (`localflare-storage`).
//! Durable object and queue dispatch is scheduled by
//! `localflare-scheduler`. This binary is just the wiring: parse config,
//! open storage, and expose an admin HTTP surface in front of it all.

mod config;
mod registry;
mod routes;

use std::sync::Arc;

use axum::routing::{any, get, post};
use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;

use config::Config;
use registry::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    let bind_addr = config.bind_addr;
    let state = AppState::new(config)?;

    let app = Router::new()
        .route("/workers", get(routes::list_workers))
        .route("/workers/:name", post(routes::register_worker).get(routes::get_worker))
        .route("/do-namespaces/:name", post(routes::create_do_namespace))
        .route("/queues/:name", post(routes::create_queue))
        .route("/queues/:name/consumer", post(routes::register_queue_consumer))
        .route("/vector-indexes/:name", post(routes::create_vector_index))
        .route("/run/:name/*path", any(routes::run))
        .route("/stats", get(routes::stats))
        .route("/healthz", get(routes::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "localflare listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

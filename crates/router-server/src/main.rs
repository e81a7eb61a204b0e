mod config;
mod http;
mod transport;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use router_core::{ByteTokenizer, Dispatcher, Policy, WorkerId, WorkerRegistry};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log_filter))
        .init();

    let policy = Policy::from_str(&cli.policy, cli.affinity_threshold)
        .context("invalid --policy value")?;

    let registry = Arc::new(WorkerRegistry::new(|address: &str| http::build_transport(address)));
    for address in &cli.workers {
        registry
            .add(WorkerId::from(address.as_str()), address.clone())
            .with_context(|| format!("registering worker {address}"))?;
    }
    tracing::info!(workers = registry.len(), policy = ?policy, "router starting");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::new(ByteTokenizer),
        policy,
    ));

    let app = http::app(http::AppState { registry, dispatcher });

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    tracing::info!(addr = %cli.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

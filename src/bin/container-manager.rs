//! Container manager entry point.
//!
//! Wires the workload registry to the RPC service, starts the cleanup
//! sweeper, and shuts every workload down when interrupted.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use holopod::constants::{DEFAULT_MANAGER_ADDRESS, ENV_LISTEN_ADDRESS};
use holopod::manager::{service, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!(version = env!("CARGO_PKG_VERSION"), "container manager starting");

    let registry = Arc::new(Registry::new().context("failed to initialize workload registry")?);
    let sweeper = Arc::clone(&registry).start_sweeper();

    let address =
        std::env::var(ENV_LISTEN_ADDRESS).unwrap_or_else(|_| DEFAULT_MANAGER_ADDRESS.to_string());
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to listen on {address}"))?;

    service::serve(listener, Arc::clone(&registry), shutdown_signal()).await?;

    info!("shutting down; closing all workloads");
    registry.shutdown().await;
    let _ = sweeper.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            match sigterm.as_mut() {
                Some(sig) => { sig.recv().await; }
                None => std::future::pending().await,
            }
        } => {}
    }
}

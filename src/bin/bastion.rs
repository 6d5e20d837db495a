//! Bastion service entry point.
//!
//! Runs as root (it owns the host packet filter), verifies that both
//! `iptables` and `ip6tables` respond, loads the network pool, and serves
//! the RPC surface until interrupted. A testing-only escape hatch
//! (`BASTION_SKIP_ROOT_CHECK=true`) allows exercising the pool without
//! root; it is loudly logged and iptables operations will fail.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use holopod::constants::{
    DEFAULT_BASTION_ADDRESS, ENV_LISTEN_ADDRESS, ENV_SKIP_ROOT_CHECK, ENV_STATE_FILE,
};
use holopod::engine::{Engine, NetworkBackend};
use holopod::firewall;
use holopod::netpool::{NetworkPool, SubnetConfig};
use holopod::bastion::{server, BastionService};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    if skip_root_check() {
        warn!("root check skipped for testing ({ENV_SKIP_ROOT_CHECK}=true)");
        warn!("iptables operations will fail without root privileges");
    } else if unsafe { libc::getuid() } != 0 {
        error!("bastion service must run as root for iptables operations");
        error!("run with: sudo bastion, or set {ENV_SKIP_ROOT_CHECK}=true for testing the network pool only");
        std::process::exit(1);
    }

    info!(version = VERSION, "bastion service starting");

    firewall::check_iptables()
        .await
        .context("iptables check failed; ensure iptables and ip6tables are installed")?;

    let engine = Engine::connect()
        .await
        .context("container engine unavailable")?;
    let backend: Arc<dyn NetworkBackend> = Arc::new(engine);

    let state_file = std::env::var(ENV_STATE_FILE).ok().map(Into::into);
    let pool = Arc::new(
        NetworkPool::load(state_file, SubnetConfig::from_env(), Arc::clone(&backend))
            .await
            .context("failed to initialize network pool")?,
    );
    let cleanup_task = Arc::clone(&pool).start_cleanup();
    info!("network pool initialized and cleanup task started");

    let address =
        std::env::var(ENV_LISTEN_ADDRESS).unwrap_or_else(|_| DEFAULT_BASTION_ADDRESS.to_string());
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to listen on {address}"))?;

    let service = Arc::new(BastionService::new(VERSION, Arc::clone(&pool), backend));

    info!(address = %address, "serving bastion RPC; all operations validated and audit logged");

    server::serve(listener, service, shutdown_signal()).await?;

    info!("shutting down gracefully");
    pool.stop();
    let _ = cleanup_task.await;
    info!("shutdown complete");
    Ok(())
}

fn skip_root_check() -> bool {
    matches!(
        std::env::var(ENV_SKIP_ROOT_CHECK).as_deref(),
        Ok("true") | Ok("1")
    )
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

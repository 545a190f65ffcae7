//! Policy Status Sync Controller
//!
//! Runs on a managed cluster and keeps the status of replicated policies in
//! sync with their copies in the cluster namespace on the hub.
//!
//! Startup order:
//! 1. Resolve the hub and managed cluster connections
//! 2. Parse the watch scope
//! 3. Build the manager (leader election, probes, no metrics)
//! 4. Register the status reconciler
//! 5. Create the cluster namespace(s) on the managed cluster
//! 6. Run the manager and, if enabled, the addon lease heartbeat until
//!    SIGINT/SIGTERM

mod bootstrap;
mod config;
mod error;
mod lease;
mod namespace;
mod reconciler;

use std::sync::Arc;

use clap::Parser;
use cluster_connection::{ConnectionResolver, NamespaceScope};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Options;
use crate::error::ControllerError;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let options = Options::parse();

    let filter = EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Configure rustls crypto provider before any client is built
    cluster_connection::install_default_crypto_provider();

    info!("Starting Policy Status Sync {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}, architecture: {}", std::env::consts::OS, std::env::consts::ARCH);

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    run(options, shutdown).await
}

async fn run(options: Options, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let bootstrap_options = options.bootstrap();

    let (hub, managed) = ConnectionResolver::new(options.hub_config.clone(), options.managed_config.clone())
        .resolve()
        .await?;
    info!("Hub cluster config: {}", hub.source());
    info!("Managed cluster config: {}", managed.source());

    let scope = NamespaceScope::parse(&options.watch_namespace);
    let scheme = Arc::new(bootstrap::build_scheme());

    let mut manager =
        bootstrap::bootstrap_manager(&bootstrap_options, scope.clone(), scheme, &managed, &hub).await?;
    bootstrap::register_reconciler(&mut manager, &hub)?;

    namespace::ensure_namespaces(managed.client(), &scope).await?;

    let heartbeat =
        lease::start_lease_heartbeat(&bootstrap_options, hub.client(), managed.client(), &scope, &shutdown).await?;

    info!("Starting manager");
    let result = manager.start(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(heartbeat) = heartbeat {
        heartbeat.shutdown().await;
    }

    result?;
    info!("Policy Status Sync stopped");
    Ok(())
}

/// Cancels `token` on the first SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for SIGINT: {}", e);
                return;
            }
            info!("Received SIGINT, shutting down");
        }
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    token.cancel();
}

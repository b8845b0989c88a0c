//! edged, the edge node agent
//!
//! Runs on each edge node and keeps its Docker containers converged with the
//! pods listed in a local manifest.
//!
//! ## Architecture
//!
//! - **Sync Loop**: re-reads the manifest and dispatches pod work
//! - **Pod Workers**: sync or terminate individual pods through the engine
//! - **GC Worker**: periodically evicts containers of pods no longer desired
//! - **Runtime**: Docker Engine API over the local Unix socket

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edged_agent::config::Config;
use edged_agent::docker::DockerRuntime;
use edged_agent::manifest::ManifestSource;
use edged_agent::sync_loop::{DesiredPods, SyncLoop};
use edged_agent::workers::{GcWorker, PodWorkers};
use edged_agent::ContainerEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so the log level can come from it
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting edged");
    info!(
        node_name = %config.node_name,
        docker_socket = %config.docker_socket.display(),
        manifest = %config.manifest_path.display(),
        "Configuration loaded"
    );

    let runtime = DockerRuntime::new(&config.docker_socket, config.docker_timeout);
    if !runtime.socket_exists() {
        warn!(
            docker_socket = %config.docker_socket.display(),
            "Docker socket not found, runtime calls will fail until it appears"
        );
    }

    let engine = Arc::new(ContainerEngine::new(Arc::new(runtime), config.engine()));

    if let Err(e) = engine.init_pod_index().await {
        warn!(error = %e, "Failed to rebuild pod index, starting empty");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let desired = DesiredPods::new();
    let workers = Arc::new(PodWorkers::spawn(
        Arc::clone(&engine),
        config.workers,
        shutdown_rx.clone(),
    ));

    let sync_loop = SyncLoop::new(
        ManifestSource::new(&config.manifest_path),
        Arc::clone(&engine),
        Arc::clone(&workers),
        desired.clone(),
        config.sync_interval,
    );
    let mut sync_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { sync_loop.run(shutdown_rx).await }
    });

    let gc_worker = GcWorker::new(
        Arc::clone(&engine),
        desired,
        config.gc.clone(),
        config.gc_interval,
    );
    let gc_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { gc_worker.run(shutdown_rx).await }
    });

    // Wait for shutdown signal
    let sync_exited = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            false
        }
        _ = &mut sync_handle => {
            warn!("Sync loop exited");
            true
        }
    };

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !sync_exited {
        if let Err(e) = sync_handle.await {
            error!(error = %e, "Sync loop panicked");
        }
    }
    if let Err(e) = gc_handle.await {
        error!(error = %e, "GC worker panicked");
    }
    match Arc::try_unwrap(workers) {
        Ok(workers) => workers.join().await,
        Err(_) => warn!("Pod workers still referenced, not waiting for them"),
    }

    info!("edged shutdown complete");
    Ok(())
}

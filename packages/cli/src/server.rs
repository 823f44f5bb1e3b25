// ABOUTME: Wires runtime, store, reconciler and HTTP router into a running server
// ABOUTME: Background loops stop only after the listener has drained on shutdown

use crate::config::{Config, RuntimeKind};
use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use dockformer_api::{create_router, AppState};
use dockformer_reconciler::{LogStreamer, ReconcileError, Reconciler, Supervisor};
use dockformer_runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
use dockformer_storage::ManifestStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

pub fn build_runtime(config: &Config) -> Result<Arc<dyn ContainerRuntime>> {
    match config.runtime {
        RuntimeKind::Docker => {
            let runtime = DockerRuntime::connect(config.docker())
                .context("Failed to configure the Docker client")?;
            Ok(Arc::new(runtime))
        }
        RuntimeKind::Memory => {
            warn!("Using the in-memory runtime; no real containers will be managed");
            Ok(Arc::new(MemoryRuntime::new()))
        }
    }
}

/// Reconciler backed by the configured runtime and the durable manifest store
pub async fn build_reconciler(config: &Config) -> Result<Arc<Reconciler>> {
    let runtime = build_runtime(config)?;
    let store = ManifestStore::open(&config.db_path)
        .await
        .with_context(|| format!("Failed to open manifest store at {}", config.db_path.display()))?;

    Ok(Arc::new(
        Reconciler::new(runtime, config.reconciler()).with_store(store),
    ))
}

/// Restore the last accepted manifest and, if enabled, converge on it once.
/// Startup carries on when the runtime is not reachable yet; the supervisor
/// retries on its next pass.
pub async fn bootstrap(reconciler: &Reconciler, config: &Config) -> Result<()> {
    let restored = reconciler
        .restore()
        .await
        .context("Failed to restore persisted manifest")?;

    if let Err(e) = reconciler.ping().await {
        warn!("Container runtime not reachable at startup: {}", e);
        return Ok(());
    }

    let Some(generation) = restored else {
        info!("No persisted manifest; waiting for an upload");
        return Ok(());
    };
    if !config.reconcile_on_start {
        info!(generation, "Startup reconciliation disabled");
        return Ok(());
    }

    match reconciler.reconcile().await {
        Ok(summary) if summary.is_success() => info!(
            generation,
            created = summary.created.len(),
            removed = summary.removed.len(),
            "Startup reconciliation complete"
        ),
        Ok(summary) => warn!(
            generation,
            failed = summary.failed.len(),
            "Startup reconciliation partially failed"
        ),
        Err(ReconcileError::RuntimeUnavailable(msg)) => {
            warn!("Runtime became unavailable during startup reconciliation: {}", msg)
        }
        Err(e) => error!("Startup reconciliation failed: {}", e),
    }
    Ok(())
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let origin = origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin: {}", origin))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any))
}

pub async fn run_server(config: Config) -> Result<()> {
    let reconciler = build_reconciler(&config).await?;
    bootstrap(&reconciler, &config).await?;

    let streamer = LogStreamer::new(&reconciler, config.log_streamer());
    let supervisor = Supervisor::spawn(Arc::clone(&reconciler), config.supervisor());

    let state = AppState::new(Arc::clone(&reconciler), streamer, config.api());
    let app = create_router(state).layer(cors_layer(&config.cors_origin)?);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        %addr,
        runtime = reconciler.runtime_name(),
        "DockFormer API listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    supervisor.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

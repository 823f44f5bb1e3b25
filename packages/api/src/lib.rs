// ABOUTME: HTTP API layer for DockFormer providing REST endpoints and routing
// ABOUTME: Thin translation between HTTP and the reconciler; holds no container state itself

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use dockformer_reconciler::{LogStreamer, Reconciler};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod containers_handlers;
pub mod error;
pub mod health;
pub mod manifest_handlers;
pub mod sse;

pub use error::{ApiResult, AppError};

/// Room for multipart framing around the manifest bytes
const MULTIPART_OVERHEAD: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    /// Largest manifest upload accepted
    pub max_manifest_bytes: usize,
    /// Concurrent log streams allowed per client address
    pub max_streams_per_ip: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_manifest_bytes: 1024 * 1024,
            max_streams_per_ip: sse::DEFAULT_MAX_STREAMS_PER_IP,
        }
    }
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub streamer: LogStreamer,
    pub sse: sse::SseConnectionTracker,
    pub config: ApiConfig,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>, streamer: LogStreamer, config: ApiConfig) -> Self {
        Self {
            reconciler,
            streamer,
            sse: sse::SseConnectionTracker::new(config.max_streams_per_ip),
            config,
        }
    }
}

/// Creates the full API router
pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.max_manifest_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/api/health", get(health::health_check))
        .route("/api/containers", get(containers_handlers::list_containers))
        .route(
            "/api/containers/{id}",
            get(containers_handlers::get_container).delete(containers_handlers::remove_container),
        )
        .route(
            "/api/containers/{id}/start",
            post(containers_handlers::start_container),
        )
        .route(
            "/api/containers/{id}/stop",
            post(containers_handlers::stop_container),
        )
        .route(
            "/api/containers/{id}/restart",
            post(containers_handlers::restart_container),
        )
        .route(
            "/api/containers/{id}/logs",
            get(containers_handlers::get_logs),
        )
        .route(
            "/api/containers/{id}/logs/stream",
            get(containers_handlers::stream_logs),
        )
        .route("/api/manifest", get(manifest_handlers::get_manifest))
        .route("/api/reconcile", post(manifest_handlers::reconcile))
        .route(
            "/upload",
            post(manifest_handlers::upload_manifest).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

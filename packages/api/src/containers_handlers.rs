// ABOUTME: HTTP request handlers for container status, lifecycle actions and logs
// ABOUTME: Status reads come from the status cache; actions go through the reconciler

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{Extensions, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use dockformer_runtime::ObservedContainer;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::{debug, info};

use crate::error::{ApiResult, AppError};
use crate::sse::{create_sse_response, end_event, log_event, GuardedSseStream};
use crate::AppState;

/// Set on list responses while the runtime could not be refreshed
pub const STALE_HEADER: &str = "x-dockformer-stale";

/// Container record in the shape the dashboard reads
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerDto {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Ports")]
    pub ports: String,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

impl From<&ObservedContainer> for ContainerDto {
    fn from(container: &ObservedContainer) -> Self {
        Self {
            id: container.id().to_string(),
            name: container.name().to_string(),
            image: container.image().to_string(),
            status: container.state().to_string(),
            ports: container.ports_display(),
            created_at: container.created_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    pub message: String,
    pub container: ContainerDto,
}

fn lifecycle_response(message: &str, container: &ObservedContainer) -> Json<LifecycleResponse> {
    Json(LifecycleResponse {
        message: message.to_string(),
        container: container.into(),
    })
}

/// List managed containers
///
/// GET /api/containers
pub async fn list_containers(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.reconciler.cache();
    let containers: Vec<ContainerDto> = cache.list().await.iter().map(Into::into).collect();

    let mut response = Json(containers).into_response();
    if let Some(since) = cache.stale_since().await {
        debug!(%since, "Serving stale container list");
        response
            .headers_mut()
            .insert(STALE_HEADER, HeaderValue::from_static("true"));
    }
    response
}

/// GET /api/containers/{id}
pub async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ContainerDto>> {
    let container = state.reconciler.find(&id).await?;
    Ok(Json((&container).into()))
}

/// Remove a container. Still-declared containers come back on the next
/// drift pass.
///
/// DELETE /api/containers/{id}
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    info!("Removing container: {}", id);
    let container = state.reconciler.remove(&id).await?;
    Ok(lifecycle_response("Container deleted successfully", &container))
}

/// POST /api/containers/{id}/start
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    info!("Starting container: {}", id);
    let container = state.reconciler.start(&id).await?;
    Ok(lifecycle_response("Container started successfully", &container))
}

/// POST /api/containers/{id}/stop
pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    info!("Stopping container: {}", id);
    let container = state.reconciler.stop(&id).await?;
    Ok(lifecycle_response("Container stopped successfully", &container))
}

/// POST /api/containers/{id}/restart
pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LifecycleResponse>> {
    info!("Restarting container: {}", id);
    let container = state.reconciler.restart(&id).await?;
    Ok(lifecycle_response("Container restarted successfully", &container))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
    pub container: ContainerDto,
}

/// Point-in-time log snapshot
///
/// GET /api/containers/{id}/logs?tail=N
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let snapshot = state.streamer.snapshot(&id, query.tail).await?;
    Ok(Json(LogsResponse {
        logs: snapshot.logs,
        container: (&snapshot.container).into(),
    }))
}

/// Follow a container's output as Server-Sent Events
///
/// GET /api/containers/{id}/logs/stream
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    extensions: Extensions,
) -> ApiResult<Response> {
    let ip = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let guard = state
        .sse
        .try_acquire(ip)
        .map_err(|_| AppError::TooManyStreams)?;
    let lines = state.streamer.open(&id, true).await?;
    info!(container = %id, client = %ip, "Log stream opened");

    let events = lines
        .map(|line| Ok::<_, Infallible>(log_event(&line)))
        .chain(stream::once(async { Ok(end_event()) }));

    Ok(create_sse_response(GuardedSseStream::new(events, guard)).into_response())
}

// ABOUTME: HTTP request handlers for manifest upload, inspection and manual reconciliation
// ABOUTME: Upload parses the file before anything is accepted; apply outcomes map to 200 or 207

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dockformer_manifest::{ContainerSpec, Generation};
use dockformer_reconciler::{ApplySummary, ReconcileError};
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::error::{ApiResult, AppError};
use crate::AppState;

/// Multipart field carrying the manifest file
pub const UPLOAD_FIELD: &str = "yamlFile";

#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    pub message: String,
    #[serde(flatten)]
    pub summary: ApplySummary,
}

/// 200 when every action succeeded, 207 with per-name outcomes otherwise
fn summary_response(summary: ApplySummary) -> Response {
    let (status, message) = if summary.is_success() {
        (
            StatusCode::OK,
            format!("Manifest generation {} applied", summary.generation),
        )
    } else {
        (
            StatusCode::MULTI_STATUS,
            format!(
                "Manifest generation {} applied with {} failure(s)",
                summary.generation,
                summary.failed.len()
            ),
        )
    };
    (status, Json(ApplyResponse { message, summary })).into_response()
}

fn has_yaml_extension(file_name: &str) -> bool {
    matches!(
        Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref(),
        Some("yaml") | Some("yml")
    )
}

/// Upload a manifest and reconcile it
///
/// POST /upload (multipart, field `yamlFile`)
pub async fn upload_manifest(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Failed to read upload: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::validation(format!("Failed to read upload: {}", e)))?;
        upload = Some((file_name, bytes));
        break;
    }

    let (file_name, bytes) = upload.ok_or_else(|| {
        AppError::validation(format!("Missing multipart field '{}'", UPLOAD_FIELD))
    })?;

    if let Some(name) = &file_name {
        if !has_yaml_extension(name) {
            return Err(AppError::validation(
                "File must be a YAML file (.yaml or .yml)",
            ));
        }
    }
    if bytes.len() > state.config.max_manifest_bytes {
        return Err(AppError::validation(format!(
            "Manifest is larger than {} bytes",
            state.config.max_manifest_bytes
        )));
    }

    let manifest = dockformer_manifest::parse(&bytes)?;
    info!(
        file = file_name.as_deref().unwrap_or("<unnamed>"),
        containers = manifest.len(),
        "Manifest uploaded"
    );

    let summary = state.reconciler.submit(manifest).await?;
    Ok(summary_response(summary))
}

#[derive(Debug, Serialize)]
pub struct ManifestResponse {
    pub generation: Generation,
    pub digest: String,
    pub containers: Vec<ContainerSpec>,
}

/// Latest accepted manifest
///
/// GET /api/manifest
pub async fn get_manifest(State(state): State<AppState>) -> ApiResult<Json<ManifestResponse>> {
    let manifest = state
        .reconciler
        .latest_manifest()
        .await
        .ok_or(ReconcileError::NoManifest)?;

    Ok(Json(ManifestResponse {
        generation: manifest.generation(),
        digest: manifest.digest().to_string(),
        containers: manifest.containers().to_vec(),
    }))
}

/// Re-run reconciliation of the latest manifest
///
/// POST /api/reconcile
pub async fn reconcile(State(state): State<AppState>) -> ApiResult<Response> {
    info!("Manual reconciliation requested");
    let summary = state.reconciler.reconcile().await?;
    Ok(summary_response(summary))
}

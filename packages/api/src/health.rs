// ABOUTME: Health endpoint reporting service version and container runtime reachability

use axum::{extract::State, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::AppState;

/// GET /api/health
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let reconciler = &state.reconciler;
    let reachable = reconciler.ping().await.is_ok();
    let stale = reconciler.cache().stale_since().await.is_some();

    Json(json!({
        "status": if reachable { "healthy" } else { "degraded" },
        "service": "dockformer",
        "version": env!("CARGO_PKG_VERSION"),
        "runtime": reconciler.runtime_name(),
        "runtime_reachable": reachable,
        "generation": reconciler.current_generation().await,
        "stale": stale,
        "timestamp": Utc::now().timestamp(),
    }))
}

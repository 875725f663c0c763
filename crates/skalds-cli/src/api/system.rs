//! Service identity, health, status, dashboard summary, and metrics.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use serde_json::json;

use skalds_core::state::{SkaldKind, SkaldStatus};
use skalds_db::models::StatusCounts;
use skalds_db::queries::tasks as task_db;

use super::{ApiError, AppState};

pub async fn index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": "skalds-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "runMode": state.runtime.config.run_mode.to_string(),
    }))
}

fn service_word(up: bool) -> &'static str {
    if up { "up" } else { "down" }
}

/// `healthy` iff cache, store, and event log all answered their probes.
/// A degraded report goes out with 503 so load balancers can act on it.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.runtime.adapter_health().await;
    let status = if health.all_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if health.all_healthy() { "healthy" } else { "degraded" },
        "services": {
            "cache": service_word(health.cache),
            "store": service_word(health.store),
            "event": service_word(health.event),
        },
    });
    (status, Json(body))
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "runMode": state.runtime.config.run_mode.to_string(),
        "components": state.runtime.component_status(),
    }))
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct FleetCounts {
    total: usize,
    online: usize,
    offline: usize,
    nodes: usize,
    edges: usize,
    running_tasks: usize,
}

fn fleet_counts(state: &AppState) -> FleetCounts {
    let mut counts = FleetCounts::default();
    for skald in state.runtime.skalds.snapshot() {
        counts.total += 1;
        match skald.status {
            SkaldStatus::Online => counts.online += 1,
            SkaldStatus::Offline => counts.offline += 1,
        }
        match skald.kind {
            SkaldKind::Node => counts.nodes += 1,
            SkaldKind::Edge => counts.edges += 1,
        }
        counts.running_tasks += skald.current_tasks.len();
    }
    counts
}

async fn task_counts(state: &AppState) -> Result<StatusCounts, ApiError> {
    task_db::count_by_status(&state.runtime.pool)
        .await
        .map_err(ApiError::unavailable)
}

pub async fn dashboard_summary(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let fleet = fleet_counts(&state);
    let tasks = task_counts(&state).await?;
    Ok(Json(json!({
        "skalds": fleet,
        "tasks": tasks,
    })))
}

pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let fleet = fleet_counts(&state);
    let tasks = task_counts(&state).await?;

    // Mean in-flight tasks per online skald; zero when the fleet is empty.
    let utilization = if fleet.online > 0 {
        fleet.running_tasks as f64 / fleet.online as f64
    } else {
        0.0
    };

    let body = json!({
        "fleet": fleet,
        "tasks": tasks,
        "monitoredTasks": state.runtime.tasks.len(),
        "dispatch": {
            "policy": state.runtime.config.dispatch_policy.to_string(),
            "assignmentTimeouts": state.runtime.reconciler.demotion_count(),
        },
        "events": {
            "connectedClients": state.sse_clients.load(std::sync::atomic::Ordering::Relaxed),
        },
        "utilization": utilization,
    });
    Ok(Json(body))
}

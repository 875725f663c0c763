//! Fleet queries, served entirely from the in-memory skald store.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use skalds_core::state::{SkaldKind, SkaldRecord, SkaldStatus};

use super::{ApiError, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkaldResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SkaldKind,
    pub status: SkaldStatus,
    /// Epoch millis, as a string.
    pub last_active: String,
    pub heartbeat: i64,
    pub supported_task_types: Vec<String>,
    pub current_tasks: Vec<String>,
}

impl From<SkaldRecord> for SkaldResponse {
    fn from(record: SkaldRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            status: record.status,
            last_active: record.last_active_ms.to_string(),
            heartbeat: record.heartbeat,
            supported_task_types: record.supported_task_types.into_iter().collect(),
            current_tasks: record.current_tasks.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SkaldListQuery {
    /// Filter by kind: `Node` or `Edge`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Filter by status: `Online` or `Offline`.
    pub status: Option<String>,
}

pub async fn list_skalds(
    State(state): State<AppState>,
    Query(query): Query<SkaldListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => Some(
            raw.parse::<SkaldKind>()
                .map_err(|e| ApiError::validation(e.to_string()))?,
        ),
    };
    let status = match query.status.as_deref() {
        None => None,
        Some("Online") | Some("online") => Some(SkaldStatus::Online),
        Some("Offline") | Some("offline") => Some(SkaldStatus::Offline),
        Some(other) => {
            return Err(ApiError::validation(format!("invalid skald status: {other:?}")));
        }
    };

    let items: Vec<SkaldResponse> = state
        .runtime
        .skalds
        .snapshot()
        .into_iter()
        .filter(|s| kind.is_none_or(|k| s.kind == k))
        .filter(|s| status.is_none_or(|st| s.status == st))
        .map(SkaldResponse::from)
        .collect();

    Ok(Json(json!({ "items": items, "total": items.len() })))
}

pub async fn get_skald(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SkaldResponse>, ApiError> {
    state
        .runtime
        .skalds
        .get(&id)
        .map(|record| Json(record.into()))
        .ok_or_else(|| ApiError::skald_not_found(&id))
}

pub async fn get_skald_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .runtime
        .skalds
        .get(&id)
        .ok_or_else(|| ApiError::skald_not_found(&id))?;

    let tasks: Vec<String> = record.current_tasks.into_iter().collect();
    Ok(Json(json!({ "skaldId": id, "tasks": tasks })))
}

pub async fn get_skald_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .runtime
        .skalds
        .get(&id)
        .ok_or_else(|| ApiError::skald_not_found(&id))?;

    Ok(Json(json!({
        "skaldId": id,
        "status": record.status,
        "lastActive": record.last_active_ms.to_string(),
        "heartbeat": record.heartbeat,
    })))
}

pub async fn summary_statistics(State(state): State<AppState>) -> impl IntoResponse {
    let mut online = 0usize;
    let mut offline = 0usize;
    let mut nodes = 0usize;
    let mut edges = 0usize;
    let mut current_tasks = 0usize;

    let snapshot = state.runtime.skalds.snapshot();
    for skald in &snapshot {
        match skald.status {
            SkaldStatus::Online => online += 1,
            SkaldStatus::Offline => offline += 1,
        }
        match skald.kind {
            SkaldKind::Node => nodes += 1,
            SkaldKind::Edge => edges += 1,
        }
        current_tasks += skald.current_tasks.len();
    }

    Json(json!({
        "total": snapshot.len(),
        "online": online,
        "offline": offline,
        "byType": { "node": nodes, "edge": edges },
        "totalCurrentTasks": current_tasks,
    }))
}

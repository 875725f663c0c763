//! Task queries and the two externally writable operations: status updates
//! and attachment hot-updates.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use skalds_core::cache::keys;
use skalds_core::reconcile::ControlOutcome;
use skalds_db::models::{LifecycleStatus, Task, TaskFilter, TaskMode};
use skalds_db::queries::tasks as task_db;

use super::{ApiError, AppState};

const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub id: String,
    pub class_name: String,
    pub source: String,
    pub executor: Option<String>,
    pub dependencies: Option<Vec<String>>,
    pub mode: TaskMode,
    pub lifecycle_status: LifecycleStatus,
    pub priority: i32,
    pub attachments: Option<serde_json::Value>,
    /// Epoch millis, as strings.
    pub create_date_time: String,
    pub update_date_time: String,
    pub deadline_date_time: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            class_name: task.class_name,
            source: task.source,
            executor: task.executor,
            dependencies: task.dependencies,
            mode: task.mode,
            lifecycle_status: task.lifecycle_status,
            priority: task.priority,
            attachments: task.attachments,
            create_date_time: task.create_date_time.timestamp_millis().to_string(),
            update_date_time: task.update_date_time.timestamp_millis().to_string(),
            deadline_date_time: task
                .deadline_date_time
                .map(|d| d.timestamp_millis().to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    /// Lifecycle status filter, e.g. `Running`.
    pub status: Option<String>,
    /// Class-name filter.
    #[serde(rename = "type")]
    pub class_name: Option<String>,
    pub executor: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.unwrap_or(1);
    if page < 1 {
        return Err(ApiError::validation("page is 1-based"));
    }
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if page_size < 1 {
        return Err(ApiError::validation("pageSize must be positive"));
    }
    // Oversized pages are clamped, not rejected.
    let page_size = page_size.min(state.runtime.config.page_size_max);

    let statuses = match query.status.as_deref() {
        None => Vec::new(),
        Some(raw) => vec![
            raw.parse::<LifecycleStatus>()
                .map_err(|e| ApiError::validation(e.to_string()))?,
        ],
    };
    let filter = TaskFilter {
        statuses,
        class_name: query.class_name,
        executor: query.executor,
        id: None,
    };

    let (items, total) = task_db::list_tasks(&state.runtime.pool, &filter, page, page_size)
        .await
        .map_err(ApiError::unavailable)?;

    let items: Vec<TaskResponse> = items.into_iter().map(TaskResponse::from).collect();
    Ok(Json(json!({
        "items": items,
        "total": total,
        "page": page,
        "pageSize": page_size,
    })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = task_db::get_task(&state.runtime.pool, &id)
        .await
        .map_err(ApiError::unavailable)?
        .ok_or_else(|| ApiError::task_not_found(&id))?;
    Ok(Json(task.into()))
}

/// Live heartbeat view: from the monitored-task store when present, straight
/// from the cache otherwise (e.g. in controller mode, where no monitor runs).
pub async fn get_task_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    task_db::get_task(&state.runtime.pool, &id)
        .await
        .map_err(ApiError::unavailable)?
        .ok_or_else(|| ApiError::task_not_found(&id))?;

    if let Some(record) = state.runtime.tasks.get(&id) {
        return Ok(Json(json!({
            "taskId": id,
            "heartbeat": record.heartbeat,
            "error": record.error,
            "exception": record.exception,
        })));
    }

    let heartbeat = state
        .runtime
        .cache
        .get_string(&keys::task_heartbeat(&id))
        .await
        .map_err(|e| ApiError::unavailable(e.into()))?
        .and_then(|raw| raw.parse::<i64>().ok());
    let error = state
        .runtime
        .cache
        .get_string(&keys::task_error(&id))
        .await
        .map_err(|e| ApiError::unavailable(e.into()))?
        .filter(|s| !s.is_empty());
    let exception = state
        .runtime
        .cache
        .get_string(&keys::task_exception(&id))
        .await
        .map_err(|e| ApiError::unavailable(e.into()))?
        .filter(|s| !s.is_empty());

    Ok(Json(json!({
        "taskId": id,
        "heartbeat": heartbeat,
        "error": error,
        "exception": exception,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateBody {
    pub status: String,
}

/// `PUT /api/tasks/{id}/status` -- only `Created` (re-queue from `Paused`)
/// and `Cancelled` may be requested from outside.
pub async fn put_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let requested = body
        .status
        .parse::<LifecycleStatus>()
        .map_err(|e| ApiError::validation(e.to_string()))?;

    let outcome = match requested {
        LifecycleStatus::Cancelled => state
            .runtime
            .reconciler
            .external_cancel(&id)
            .await
            .map_err(ApiError::unavailable)?,
        LifecycleStatus::Created => state
            .runtime
            .reconciler
            .external_requeue(&id)
            .await
            .map_err(ApiError::unavailable)?,
        other => {
            return Err(ApiError::validation(format!(
                "status {other} cannot be requested externally; use Created or Cancelled"
            )));
        }
    };

    match outcome {
        ControlOutcome::Applied | ControlOutcome::NoOp => {
            Ok(Json(json!({ "id": id, "status": requested })))
        }
        ControlOutcome::Invalid(current) => Err(ApiError::invalid_status(format!(
            "cannot move task {id} from {current} to {requested}"
        ))),
        ControlOutcome::NotFound => Err(ApiError::task_not_found(&id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachmentsBody {
    pub attachments: serde_json::Value,
}

/// `PUT /api/tasks/{id}/attachments` -- persists the payload and emits the
/// hot-update event the owning executor listens for.
pub async fn put_task_attachments(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AttachmentsBody>,
) -> Result<Json<TaskResponse>, ApiError> {
    if !body.attachments.is_object() {
        return Err(ApiError::validation("attachments must be a JSON object"));
    }

    let outcome = state
        .runtime
        .reconciler
        .external_update_attachments(&id, &body.attachments)
        .await
        .map_err(ApiError::unavailable)?;

    match outcome {
        ControlOutcome::NotFound => Err(ApiError::task_not_found(&id)),
        _ => {
            let task = task_db::get_task(&state.runtime.pool, &id)
                .await
                .map_err(ApiError::unavailable)?
                .ok_or_else(|| ApiError::task_not_found(&id))?;
            Ok(Json(task.into()))
        }
    }
}

//! Query functions for the `tasks` collection.
//!
//! Status transitions are compare-and-set: every UPDATE carries the allowed
//! previous statuses in its WHERE clause and reports rows affected, so racing
//! writers cannot double-apply a transition.

use anyhow::{Context, Result};
use sqlx::PgPool;
use thiserror::Error;

use crate::models::{LifecycleStatus, NewTask, StatusCounts, Task, TaskFilter};

/// Error returned by [`create_task`].
#[derive(Debug, Error)]
pub enum CreateTaskError {
    /// A task with the same id already exists.
    #[error("task {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Insert a new task row. Returns the inserted task with server-generated
/// timestamps. Fails with [`CreateTaskError::AlreadyExists`] on id collision.
pub async fn create_task(pool: &PgPool, new: &NewTask) -> Result<Task, CreateTaskError> {
    let result = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, class_name, source, dependencies, mode, priority, \
                            attachments, is_persistent, deadline_date_time) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.class_name)
    .bind(&new.source)
    .bind(&new.dependencies)
    .bind(new.mode)
    .bind(new.priority)
    .bind(&new.attachments)
    .bind(new.is_persistent)
    .bind(new.deadline_date_time)
    .fetch_one(pool)
    .await;

    match result {
        Ok(task) => Ok(task),
        Err(e) if is_unique_violation(&e) => Err(CreateTaskError::AlreadyExists(new.id.clone())),
        Err(e) => Err(CreateTaskError::Database(
            anyhow::Error::new(e).context("failed to insert task"),
        )),
    }
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks matching a filter, newest first, paginated (1-based pages).
///
/// Returns `(items, total)` where `total` counts every row matching the
/// filter regardless of pagination.
pub async fn list_tasks(
    pool: &PgPool,
    filter: &TaskFilter,
    page: i64,
    page_size: i64,
) -> Result<(Vec<Task>, i64)> {
    let statuses: Option<Vec<String>> = if filter.statuses.is_empty() {
        None
    } else {
        Some(
            filter
                .statuses
                .iter()
                .map(|s| s.as_db_str().to_owned())
                .collect(),
        )
    };
    let offset = (page.max(1) - 1) * page_size;

    const WHERE: &str = "($1::text[] IS NULL OR lifecycle_status = ANY($1)) \
         AND ($2::text IS NULL OR class_name = $2) \
         AND ($3::text IS NULL OR executor = $3) \
         AND ($4::text IS NULL OR id = $4)";

    let select = format!(
        "SELECT * FROM tasks WHERE {WHERE} \
         ORDER BY create_date_time DESC, id ASC \
         LIMIT $5 OFFSET $6"
    );
    let items = sqlx::query_as::<_, Task>(&select)
        .bind(&statuses)
        .bind(&filter.class_name)
        .bind(&filter.executor)
        .bind(&filter.id)
        .bind(page_size)
        .bind(offset)
        .fetch_all(pool)
        .await
        .context("failed to list tasks")?;

    let count = format!("SELECT COUNT(*) FROM tasks WHERE {WHERE}");
    let total: i64 = sqlx::query_scalar(&count)
        .bind(&statuses)
        .bind(&filter.class_name)
        .bind(&filter.executor)
        .bind(&filter.id)
        .fetch_one(pool)
        .await
        .context("failed to count tasks")?;

    Ok((items, total))
}

/// All tasks the monitor watches: `lifecycle_status IN (assigning, running)`.
pub async fn list_monitored_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE lifecycle_status IN ('assigning', 'running') \
         ORDER BY create_date_time ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list monitored tasks")?;

    Ok(tasks)
}

/// All tasks eligible for dispatch: passive mode, `created` or `paused`,
/// ordered by priority (highest first) then age (oldest first).
pub async fn list_dispatchable_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE lifecycle_status IN ('created', 'paused') AND mode = 'passive' \
         ORDER BY priority DESC, create_date_time ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list dispatchable tasks")?;

    Ok(tasks)
}

// -----------------------------------------------------------------------
// Compare-and-set transitions
// -----------------------------------------------------------------------

/// Atomically transition a task to `to` if its current status is in
/// `allowed_from`. Returns rows affected (0 means the CAS lost or the task
/// does not exist).
pub async fn transition_lifecycle(
    pool: &PgPool,
    id: &str,
    allowed_from: &[LifecycleStatus],
    to: LifecycleStatus,
) -> Result<u64> {
    let from: Vec<String> = allowed_from.iter().map(|s| s.as_db_str().to_owned()).collect();

    let result = sqlx::query(
        "UPDATE tasks \
         SET lifecycle_status = $1, update_date_time = NOW() \
         WHERE id = $2 AND lifecycle_status = ANY($3)",
    )
    .bind(to)
    .bind(id)
    .bind(&from)
    .execute(pool)
    .await
    .context("failed to transition task lifecycle status")?;

    Ok(result.rows_affected())
}

/// Dispatch assignment as a single CAS statement: set the executor and move
/// `created`/`paused` -> `assigning` in one UPDATE, so a losing race leaves no
/// partial write behind.
pub async fn assign_for_dispatch(pool: &PgPool, id: &str, skald_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET executor = $1, lifecycle_status = 'assigning', update_date_time = NOW() \
         WHERE id = $2 \
           AND lifecycle_status IN ('created', 'paused') \
           AND mode = 'passive'",
    )
    .bind(skald_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign task for dispatch")?;

    Ok(result.rows_affected())
}

/// Assignment-timeout compensation: demote an `assigning` task back to
/// `created` and clear its executor so the next dispatcher tick retries.
pub async fn demote_assigning(pool: &PgPool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET lifecycle_status = 'created', executor = NULL, update_date_time = NOW() \
         WHERE id = $1 AND lifecycle_status = 'assigning'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to demote assigning task")?;

    Ok(result.rows_affected())
}

/// Set or clear the executor of a task.
pub async fn update_executor(pool: &PgPool, id: &str, skald_id: Option<&str>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET executor = $1, update_date_time = NOW() WHERE id = $2",
    )
    .bind(skald_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task executor")?;

    Ok(result.rows_affected())
}

/// Replace the attachments payload of a task.
pub async fn update_attachments(
    pool: &PgPool,
    id: &str,
    attachments: &serde_json::Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET attachments = $1, update_date_time = NOW() WHERE id = $2",
    )
    .bind(attachments)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task attachments")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Summaries
// -----------------------------------------------------------------------

/// Task counts grouped by lifecycle status.
pub async fn count_by_status(pool: &PgPool) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT lifecycle_status, COUNT(*) AS cnt \
         FROM tasks \
         GROUP BY lifecycle_status",
    )
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status")?;

    let mut counts = StatusCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "created" => counts.created = *count,
            "assigning" => counts.assigning = *count,
            "running" => counts.running = *count,
            "paused" => counts.paused = *count,
            "finished" => counts.finished = *count,
            "failed" => counts.failed = *count,
            "cancelled" => counts.cancelled = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

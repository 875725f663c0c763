//! Integration tests for task queries: CRUD, filters, pagination, and the
//! compare-and-set transition paths.

use skalds_db::models::{LifecycleStatus, NewTask, TaskFilter, TaskMode};
use skalds_db::queries::tasks;
use skalds_test_utils::{TestDb, seed_assigning_task, seed_running_task, seed_task};

#[tokio::test]
async fn create_and_get_task() {
    let db = TestDb::create().await;

    let task = tasks::create_task(&db.pool, &NewTask::passive("t1", "VideoWorker"))
        .await
        .expect("create_task should succeed");

    assert_eq!(task.id, "t1");
    assert_eq!(task.class_name, "VideoWorker");
    assert_eq!(task.lifecycle_status, LifecycleStatus::Created);
    assert_eq!(task.mode, TaskMode::Passive);
    assert_eq!(task.priority, 0);
    assert!(task.executor.is_none());

    let fetched = tasks::get_task(&db.pool, "t1")
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.create_date_time, task.create_date_time);

    db.teardown().await;
}

#[tokio::test]
async fn create_task_rejects_duplicate_id() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "dup", "W").await;

    let err = tasks::create_task(&db.pool, &NewTask::passive("dup", "W"))
        .await
        .expect_err("second insert should fail");
    assert!(matches!(
        err,
        tasks::CreateTaskError::AlreadyExists(ref id) if id == "dup"
    ));

    db.teardown().await;
}

#[tokio::test]
async fn get_task_returns_none_for_missing_id() {
    let db = TestDb::create().await;

    let result = tasks::get_task(&db.pool, "nope")
        .await
        .expect("get_task should not error");
    assert!(result.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn list_tasks_filters_and_paginates() {
    let db = TestDb::create().await;

    for i in 0..5 {
        seed_task(&db.pool, &format!("t{i}"), "W").await;
    }
    seed_task(&db.pool, "other", "X").await;

    // Filter by class name.
    let filter = TaskFilter {
        class_name: Some("W".to_owned()),
        ..Default::default()
    };
    let (items, total) = tasks::list_tasks(&db.pool, &filter, 1, 10)
        .await
        .expect("list should succeed");
    assert_eq!(total, 5);
    assert_eq!(items.len(), 5);

    // Pagination: page 2 of size 2 over 5 rows.
    let (page2, total) = tasks::list_tasks(&db.pool, &filter, 2, 2)
        .await
        .expect("list should succeed");
    assert_eq!(total, 5);
    assert_eq!(page2.len(), 2);

    // Filter by status.
    let filter = TaskFilter {
        statuses: vec![LifecycleStatus::Created],
        ..Default::default()
    };
    let (_, total) = tasks::list_tasks(&db.pool, &filter, 1, 100)
        .await
        .expect("list should succeed");
    assert_eq!(total, 6);

    // Filter by id.
    let filter = TaskFilter {
        id: Some("other".to_owned()),
        ..Default::default()
    };
    let (items, total) = tasks::list_tasks(&db.pool, &filter, 1, 100)
        .await
        .expect("list should succeed");
    assert_eq!(total, 1);
    assert_eq!(items[0].class_name, "X");

    db.teardown().await;
}

#[tokio::test]
async fn dispatchable_tasks_exclude_active_and_order_by_priority_then_age() {
    let db = TestDb::create().await;

    let mut low = NewTask::passive("low", "W");
    low.priority = 1;
    let mut high = NewTask::passive("high", "W");
    high.priority = 9;
    let mut active = NewTask::passive("active", "W");
    active.mode = TaskMode::Active;
    active.priority = 10;

    // Insert lowest priority first so age alone would order it first.
    tasks::create_task(&db.pool, &low).await.expect("insert");
    tasks::create_task(&db.pool, &high).await.expect("insert");
    tasks::create_task(&db.pool, &active).await.expect("insert");

    let dispatchable = tasks::list_dispatchable_tasks(&db.pool)
        .await
        .expect("list should succeed");
    let ids: Vec<&str> = dispatchable.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["high", "low"]);

    db.teardown().await;
}

#[tokio::test]
async fn monitored_tasks_are_assigning_and_running_only() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "c", "W").await;
    seed_assigning_task(&db.pool, "a", "W", "s1").await;
    seed_running_task(&db.pool, "b", "W", "s1").await;

    let monitored = tasks::list_monitored_tasks(&db.pool).await.expect("list");
    let ids: Vec<&str> = monitored.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    db.teardown().await;
}

#[tokio::test]
async fn transition_cas_loses_when_status_does_not_match() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "t1", "W").await;

    // created -> running is not in the allowed-from set here.
    let rows = tasks::transition_lifecycle(
        &db.pool,
        "t1",
        &[LifecycleStatus::Running],
        LifecycleStatus::Finished,
    )
    .await
    .expect("query should succeed");
    assert_eq!(rows, 0);

    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.lifecycle_status, LifecycleStatus::Created);

    db.teardown().await;
}

#[tokio::test]
async fn assign_for_dispatch_sets_executor_and_status_atomically() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "t1", "W").await;

    let rows = tasks::assign_for_dispatch(&db.pool, "t1", "s1").await.expect("assign");
    assert_eq!(rows, 1);

    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.lifecycle_status, LifecycleStatus::Assigning);
    assert_eq!(task.executor.as_deref(), Some("s1"));

    // Second assignment must lose the CAS: the task is no longer dispatchable.
    let rows = tasks::assign_for_dispatch(&db.pool, "t1", "s2").await.expect("assign");
    assert_eq!(rows, 0);
    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.executor.as_deref(), Some("s1"));

    db.teardown().await;
}

#[tokio::test]
async fn demote_assigning_requeues_and_clears_executor() {
    let db = TestDb::create().await;

    seed_assigning_task(&db.pool, "t1", "W", "s1").await;

    let rows = tasks::demote_assigning(&db.pool, "t1").await.expect("demote");
    assert_eq!(rows, 1);

    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.lifecycle_status, LifecycleStatus::Created);
    assert!(task.executor.is_none());

    // Demoting a non-assigning task is a no-op.
    let rows = tasks::demote_assigning(&db.pool, "t1").await.expect("demote");
    assert_eq!(rows, 0);

    db.teardown().await;
}

#[tokio::test]
async fn update_executor_sets_and_clears() {
    let db = TestDb::create().await;

    let created = seed_task(&db.pool, "t1", "W").await;

    let rows = tasks::update_executor(&db.pool, "t1", Some("s1")).await.expect("update");
    assert_eq!(rows, 1);
    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.executor.as_deref(), Some("s1"));
    assert!(task.update_date_time > created.update_date_time);

    let rows = tasks::update_executor(&db.pool, "t1", None).await.expect("update");
    assert_eq!(rows, 1);
    let cleared = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert!(cleared.executor.is_none());
    assert!(cleared.update_date_time > task.update_date_time);

    // Unknown ids touch nothing.
    let rows = tasks::update_executor(&db.pool, "missing", Some("s1")).await.expect("update");
    assert_eq!(rows, 0);

    db.teardown().await;
}

#[tokio::test]
async fn update_attachments_replaces_payload() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "t1", "W").await;

    let payload = serde_json::json!({"fps": 30, "source": "rtsp://cam-1"});
    let rows = tasks::update_attachments(&db.pool, "t1", &payload).await.expect("update");
    assert_eq!(rows, 1);

    let task = tasks::get_task(&db.pool, "t1").await.expect("get").expect("exists");
    assert_eq!(task.attachments, Some(payload));

    db.teardown().await;
}

#[tokio::test]
async fn count_by_status_groups_all_rows() {
    let db = TestDb::create().await;

    seed_task(&db.pool, "c", "W").await;
    seed_assigning_task(&db.pool, "a", "W", "s1").await;
    seed_task(&db.pool, "b", "W").await;
    tasks::transition_lifecycle(
        &db.pool,
        "b",
        &[LifecycleStatus::Created],
        LifecycleStatus::Cancelled,
    )
    .await
    .expect("transition");

    let counts = tasks::count_by_status(&db.pool).await.expect("count");
    assert_eq!(counts.created, 1);
    assert_eq!(counts.assigning, 1);
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.total, 3);

    db.teardown().await;
}

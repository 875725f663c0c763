//! Query API and event fanout: the HTTP surface of the controller.
//!
//! Reads serve from the in-memory state stores or the document store; writes
//! funnel through the store and event adapters via the reconciler's control
//! methods. The API never synthesizes derived fields that disagree with the
//! stores.

pub mod error;
pub mod events;
pub mod skalds;
pub mod system;
pub mod tasks;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, put};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use skalds_core::runtime::Runtime;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    /// Currently connected SSE clients.
    pub sse_clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            sse_clients: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Deadline for ordinary request handlers. The SSE routes sit outside it;
/// they are long-lived by design.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_router(state: AppState) -> Router {
    let sse_routes = Router::new()
        .route("/api/events/skalds", get(events::skald_events))
        .route("/api/events/tasks", get(events::task_events));

    Router::new()
        .route("/", get(system::index))
        .route("/api/system/health", get(system::health))
        .route("/api/system/status", get(system::status))
        .route("/api/system/dashboard/summary", get(system::dashboard_summary))
        .route("/api/system/metrics", get(system::metrics))
        .route("/api/skalds", get(skalds::list_skalds))
        .route("/api/skalds/summary/statistics", get(skalds::summary_statistics))
        .route("/api/skalds/{id}", get(skalds::get_skald))
        .route("/api/skalds/{id}/tasks", get(skalds::get_skald_tasks))
        .route("/api/skalds/{id}/status", get(skalds::get_skald_status))
        .route("/api/tasks", get(tasks::list_tasks))
        .route("/api/tasks/{id}", get(tasks::get_task))
        .route("/api/tasks/{id}/heartbeat", get(tasks::get_task_heartbeat))
        .route("/api/tasks/{id}/status", put(tasks::put_task_status))
        .route("/api/tasks/{id}/attachments", put(tasks::put_task_attachments))
        .route("/api/events/status", get(events::events_status))
        .layer(TimeoutLayer::new(HANDLER_TIMEOUT))
        .merge(sse_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    use skalds_core::cache::{CacheStore, MemoryCache, keys};
    use skalds_core::clock::FakeClock;
    use skalds_core::config::ControllerConfig;
    use skalds_core::events::{MemoryEventSink, topics};
    use skalds_core::runtime::Runtime;
    use skalds_core::state::{SkaldKind, SkaldRecord, SkaldStatus};
    use skalds_db::models::LifecycleStatus;
    use skalds_db::queries::tasks as task_db;
    use skalds_test_utils::{TestDb, seed_assigning_task, seed_running_task, seed_task};

    use super::{AppState, build_router};

    struct TestApp {
        state: AppState,
        db: TestDb,
        cache: Arc<MemoryCache>,
        events: Arc<MemoryEventSink>,
    }

    impl TestApp {
        async fn new() -> Self {
            let db = TestDb::create().await;
            let clock = FakeClock::new();
            clock.set_epoch_ms(chrono::Utc::now().timestamp_millis());
            let cache = Arc::new(MemoryCache::new(Arc::new(clock.clone())));
            let events = Arc::new(MemoryEventSink::new());
            let runtime = Runtime::new(
                ControllerConfig::default(),
                db.pool.clone(),
                cache.clone(),
                events.clone(),
                Arc::new(clock),
            );
            Self {
                state: AppState::new(runtime),
                db,
                cache,
                events,
            }
        }

        fn online_skald(&self, id: &str, classes: &[&str], current: &[&str]) {
            let mut record = SkaldRecord::new(id.to_owned(), SkaldKind::Node, 5_000);
            record.status = SkaldStatus::Online;
            record.supported_task_types = classes.iter().map(|s| s.to_string()).collect();
            record.current_tasks = current.iter().map(|s| s.to_string()).collect();
            self.state.runtime.skalds.upsert(record);
        }

        async fn get(&self, uri: &str) -> axum::response::Response {
            let app = build_router(self.state.clone());
            app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap()
        }

        async fn put_json(&self, uri: &str, body: serde_json::Value) -> axum::response::Response {
            let app = build_router(self.state.clone());
            app.oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
        }

        async fn finish(self) {
            self.db.teardown().await;
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // System
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_identifies_service() {
        let app = TestApp::new().await;

        let resp = app.get("/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["service"], "skalds-controller");
        assert_eq!(json["runMode"], "controller");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_health_reports_all_services_up() {
        let app = TestApp::new().await;

        let resp = app.get("/api/system/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["services"]["cache"], "up");
        assert_eq!(json["services"]["store"], "up");
        assert_eq!(json["services"]["event"], "up");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_dashboard_summary_counts_fleet_and_tasks() {
        let app = TestApp::new().await;
        app.online_skald("s1", &["W"], &["t9"]);
        seed_task(&app.db.pool, "t1", "W").await;

        let resp = app.get("/api/system/dashboard/summary").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["skalds"]["total"], 1);
        assert_eq!(json["skalds"]["online"], 1);
        assert_eq!(json["tasks"]["created"], 1);
        assert_eq!(json["tasks"]["total"], 1);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_metrics_exposes_counters() {
        let app = TestApp::new().await;

        let resp = app.get("/api/system/metrics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["dispatch"]["assignmentTimeouts"], 0);
        assert_eq!(json["events"]["connectedClients"], 0);
        assert_eq!(json["dispatch"]["policy"], "least_tasks");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_system_status_lists_components() {
        let app = TestApp::new().await;

        let resp = app.get("/api/system/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["runMode"], "controller");
        // Controller mode runs no loops.
        assert_eq!(json["components"], serde_json::json!([]));

        app.finish().await;
    }

    // -----------------------------------------------------------------------
    // Skalds
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_skalds_with_filters() {
        let app = TestApp::new().await;
        app.online_skald("s1", &["W"], &[]);
        let mut edge = SkaldRecord::new("e1".to_owned(), SkaldKind::Edge, 5_000);
        edge.status = SkaldStatus::Offline;
        app.state.runtime.skalds.upsert(edge);

        let resp = app.get("/api/skalds").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 2);

        let resp = app.get("/api/skalds?type=Node").await;
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["id"], "s1");

        let resp = app.get("/api/skalds?status=Offline").await;
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["id"], "e1");

        let resp = app.get("/api/skalds?type=Cloud").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "VALIDATION_ERROR");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_get_skald_and_subresources() {
        let app = TestApp::new().await;
        app.online_skald("s1", &["W"], &["t1", "t2"]);

        let resp = app.get("/api/skalds/s1").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], "s1");
        assert_eq!(json["type"], "Node");
        assert_eq!(json["status"], "Online");

        let resp = app.get("/api/skalds/s1/tasks").await;
        let json = body_json(resp).await;
        assert_eq!(json["tasks"], serde_json::json!(["t1", "t2"]));

        let resp = app.get("/api/skalds/s1/status").await;
        let json = body_json(resp).await;
        assert_eq!(json["status"], "Online");

        let resp = app.get("/api/skalds/missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "SKALD_NOT_FOUND");
        assert!(json.get("timestamp").is_some());

        app.finish().await;
    }

    #[tokio::test]
    async fn test_skald_summary_statistics() {
        let app = TestApp::new().await;
        app.online_skald("s1", &["W"], &["t1"]);
        app.online_skald("s2", &["W"], &[]);

        let resp = app.get("/api/skalds/summary/statistics").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 2);
        assert_eq!(json["online"], 2);
        assert_eq!(json["byType"]["node"], 2);
        assert_eq!(json["totalCurrentTasks"], 1);

        app.finish().await;
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_tasks_pagination_bounds() {
        let app = TestApp::new().await;
        for i in 0..3 {
            seed_task(&app.db.pool, &format!("t{i}"), "W").await;
        }

        let resp = app.get("/api/tasks").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["total"], 3);
        assert_eq!(json["page"], 1);

        // Zero page size is a validation error.
        let resp = app.get("/api/tasks?pageSize=0").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "VALIDATION_ERROR");

        // Oversized page size is clamped to the configured maximum.
        let resp = app.get("/api/tasks?pageSize=101").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["pageSize"], 100);

        // Pages are 1-based.
        let resp = app.get("/api/tasks?page=0").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Unknown status filter is a validation error.
        let resp = app.get("/api/tasks?status=Exploded").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_list_tasks_filters_by_status_and_type() {
        let app = TestApp::new().await;
        seed_task(&app.db.pool, "t1", "W").await;
        seed_assigning_task(&app.db.pool, "t2", "X", "s1").await;

        let resp = app.get("/api/tasks?status=Assigning").await;
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["id"], "t2");
        assert_eq!(json["items"][0]["executor"], "s1");

        let resp = app.get("/api/tasks?type=W").await;
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["id"], "t1");

        let resp = app.get("/api/tasks?executor=s1").await;
        let json = body_json(resp).await;
        assert_eq!(json["total"], 1);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_get_task_serializes_millis_as_strings() {
        let app = TestApp::new().await;
        seed_task(&app.db.pool, "t1", "W").await;

        let resp = app.get("/api/tasks/t1").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], "t1");
        assert_eq!(json["lifecycleStatus"], "Created");
        let created = json["createDateTime"].as_str().expect("string timestamp");
        assert!(created.parse::<i64>().is_ok());

        let resp = app.get("/api/tasks/missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "TASK_NOT_FOUND");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_task_heartbeat_reads_cache_when_unmonitored() {
        let app = TestApp::new().await;
        seed_task(&app.db.pool, "t1", "W").await;
        app.cache
            .set_string(&keys::task_heartbeat("t1"), "57", None)
            .await
            .unwrap();
        app.cache
            .set_string(&keys::task_error("t1"), "", None)
            .await
            .unwrap();

        let resp = app.get("/api/tasks/t1/heartbeat").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["heartbeat"], 57);
        assert_eq!(json["error"], serde_json::Value::Null);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_put_status_cancel_emits_once() {
        let app = TestApp::new().await;
        seed_running_task(&app.db.pool, "t1", "W", "s1").await;

        let resp = app
            .put_json("/api/tasks/t1/status", serde_json::json!({"status": "Cancelled"}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(app.events.for_topic(topics::TASK_CANCEL).len(), 1);

        let resp = app.get("/api/tasks/t1").await;
        let json = body_json(resp).await;
        assert_eq!(json["lifecycleStatus"], "Cancelled");

        // Repeating the cancel succeeds without a second event.
        let resp = app
            .put_json("/api/tasks/t1/status", serde_json::json!({"status": "Cancelled"}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(app.events.for_topic(topics::TASK_CANCEL).len(), 1);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_put_status_rejects_bad_transitions() {
        let app = TestApp::new().await;
        seed_task(&app.db.pool, "t1", "W").await;

        // Only Created and Cancelled may be requested.
        let resp = app
            .put_json("/api/tasks/t1/status", serde_json::json!({"status": "Running"}))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "VALIDATION_ERROR");

        // Created from Created is an idempotent no-op.
        let resp = app
            .put_json("/api/tasks/t1/status", serde_json::json!({"status": "Created"}))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Created from a terminal state is an invalid transition.
        task_db::transition_lifecycle(
            &app.db.pool,
            "t1",
            &[LifecycleStatus::Created],
            LifecycleStatus::Cancelled,
        )
        .await
        .expect("transition");
        let resp = app
            .put_json("/api/tasks/t1/status", serde_json::json!({"status": "Created"}))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["code"], "INVALID_STATUS");

        // Unknown task is 404.
        let resp = app
            .put_json("/api/tasks/missing/status", serde_json::json!({"status": "Cancelled"}))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        app.finish().await;
    }

    #[tokio::test]
    async fn test_put_attachments_validates_and_notifies() {
        let app = TestApp::new().await;
        seed_task(&app.db.pool, "t1", "W").await;

        let resp = app
            .put_json(
                "/api/tasks/t1/attachments",
                serde_json::json!({"attachments": [1, 2, 3]}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .put_json(
                "/api/tasks/t1/attachments",
                serde_json::json!({"attachments": {"fps": 30}}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["attachments"]["fps"], 30);
        assert_eq!(app.events.for_topic(topics::TASK_UPDATE_ATTACHMENT).len(), 1);

        let resp = app
            .put_json(
                "/api/tasks/missing/attachments",
                serde_json::json!({"attachments": {}}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        app.finish().await;
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_events_status_starts_at_zero() {
        let app = TestApp::new().await;

        let resp = app.get("/api/events/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["connectedClients"], 0);
        assert_eq!(json["status"], "ok");

        app.finish().await;
    }

    #[tokio::test]
    async fn test_skald_event_stream_delivers_updates() {
        let app = TestApp::new().await;

        // Exercise the subscription feed the SSE stream consumes.
        let mut rx = app.state.runtime.skalds.subscribe();
        app.online_skald("s1", &["W"], &[]);

        match rx.recv().await.expect("one change") {
            skalds_core::state::SkaldChange::Updated(record) => assert_eq!(record.id, "s1"),
            other => panic!("expected update, got {other:?}"),
        }

        app.finish().await;
    }
}

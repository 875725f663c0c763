//! Integration-test harness: disposable PostgreSQL databases carrying the
//! tasks schema, plus seeding helpers for the task shapes the controller
//! suites keep needing (dispatchable, assigning, running).
//!
//! One PostgreSQL server is shared per test binary. Point
//! `SKALDS_TEST_PG_URL` at an already-running server (CI) to skip the
//! testcontainers bootstrap; otherwise a container is started lazily and
//! lives for the duration of the process.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use skalds_db::models::{LifecycleStatus, NewTask, Task};
use skalds_db::pool;
use skalds_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Shared server
// ---------------------------------------------------------------------------

struct PgServer {
    /// Server root URL, no database name appended.
    root_url: String,
    /// Keeps the container alive; `None` when an external server is used.
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

impl PgServer {
    async fn get() -> &'static PgServer {
        SERVER
            .get_or_init(|| async {
                if let Ok(url) = std::env::var("SKALDS_TEST_PG_URL") {
                    return PgServer {
                        root_url: url,
                        _container: None,
                    };
                }

                let container = Postgres::default()
                    .with_tag("18")
                    .start()
                    .await
                    .expect("failed to start PostgreSQL container");
                let host = container.get_host().await.expect("container host");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("mapped container port");

                PgServer {
                    root_url: format!("postgresql://postgres:postgres@{host}:{port}"),
                    _container: Some(container),
                }
            })
            .await
    }

    /// Short-lived connection to the `postgres` maintenance database, for
    /// CREATE/DROP DATABASE statements.
    async fn admin(&self) -> PgPool {
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/postgres", self.root_url))
            .await
            .expect("failed to connect to maintenance database")
    }
}

// ---------------------------------------------------------------------------
// Per-test database
// ---------------------------------------------------------------------------

/// One disposable database with the tasks schema applied.
///
/// Create with [`TestDb::create`], hand `pool` (or clones of it) to the code
/// under test, and call [`TestDb::teardown`] at the end of the test.
pub struct TestDb {
    pub pool: PgPool,
    name: String,
}

impl TestDb {
    pub async fn create() -> Self {
        let server = PgServer::get().await;
        let name = format!("skalds_it_{}", Uuid::new_v4().simple());

        let admin = server.admin().await;
        let stmt = format!("CREATE DATABASE {name}");
        admin
            .execute(stmt.as_str())
            .await
            .unwrap_or_else(|e| panic!("failed to create database {name}: {e}"));
        admin.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("{}/{name}", server.root_url))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to database {name}: {e}"));
        pool::run_migrations(&pool)
            .await
            .expect("tasks schema should apply");

        Self { pool, name }
    }

    /// Close the pool and drop the database. Lingering connections (e.g.
    /// clones still held by a runtime under test) are terminated first.
    pub async fn teardown(self) {
        self.pool.close().await;

        let server = PgServer::get().await;
        let admin = server.admin().await;
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) \
             FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.name
        );
        let _ = admin.execute(terminate.as_str()).await;
        let stmt = format!("DROP DATABASE IF EXISTS {}", self.name);
        let _ = admin.execute(stmt.as_str()).await;
        admin.close().await;
    }
}

// ---------------------------------------------------------------------------
// Seeding helpers
// ---------------------------------------------------------------------------

/// Insert a passive task in `Created`, ready for dispatch.
pub async fn seed_task(pool: &PgPool, id: &str, class_name: &str) -> Task {
    task_db::create_task(pool, &NewTask::passive(id, class_name))
        .await
        .expect("task insert should succeed")
}

/// Insert a passive task and assign it to `skald_id`, leaving it `Assigning`.
pub async fn seed_assigning_task(pool: &PgPool, id: &str, class_name: &str, skald_id: &str) -> Task {
    seed_task(pool, id, class_name).await;
    let rows = task_db::assign_for_dispatch(pool, id, skald_id)
        .await
        .expect("assignment should succeed");
    assert_eq!(rows, 1, "seeded task {id} should be assignable");
    task_db::get_task(pool, id)
        .await
        .expect("task fetch should succeed")
        .expect("seeded task should exist")
}

/// Insert a passive task and walk it to `Running` on `skald_id`.
pub async fn seed_running_task(pool: &PgPool, id: &str, class_name: &str, skald_id: &str) -> Task {
    seed_assigning_task(pool, id, class_name, skald_id).await;
    let rows = task_db::transition_lifecycle(
        pool,
        id,
        &[LifecycleStatus::Assigning],
        LifecycleStatus::Running,
    )
    .await
    .expect("start transition should succeed");
    assert_eq!(rows, 1, "seeded task {id} should start");
    task_db::get_task(pool, id)
        .await
        .expect("task fetch should succeed")
        .expect("seeded task should exist")
}

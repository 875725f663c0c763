//! The `skalds serve` command: connect the adapters, start the run-mode
//! components, and serve the HTTP surface until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use skalds_core::cache::RedisCache;
use skalds_core::clock::SystemClock;
use skalds_core::events::KafkaEventSink;
use skalds_core::runtime::Runtime;
use skalds_db::pool;

use crate::api::{self, AppState};
use crate::config::SkaldsConfig;

/// Per-group drain window on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run_serve(config: SkaldsConfig) -> Result<()> {
    // Startup is the only place adapter failures are fatal; once serving,
    // adapter loss degrades cycles but never kills the process.
    let db_pool = pool::create_pool(&config.db).await?;
    anyhow::ensure!(
        pool::ping(&db_pool).await,
        "store unreachable at {}",
        config.db.database_url
    );

    let cache = RedisCache::connect(&config.controller.cache)
        .await
        .map_err(|e| anyhow!("failed to connect to cache at {}: {e}", config.controller.cache.url))?;

    let events = KafkaEventSink::connect(&config.controller.events)
        .map_err(|e| anyhow!("failed to connect to event log at {}: {e}", config.controller.events.brokers))?;

    let bind_host = config.controller.bind_host.clone();
    let bind_port = config.controller.bind_port;
    let mode = config.controller.run_mode;

    let runtime = Runtime::new(
        config.controller,
        db_pool,
        Arc::new(cache),
        Arc::new(events),
        Arc::new(SystemClock),
    );
    runtime.start();

    let app = api::build_router(AppState::new(runtime.clone()));
    let addr: SocketAddr = format!("{bind_host}:{bind_port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind_host}:{bind_port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(mode = %mode, "skalds controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP has drained; stop the loops dispatcher-first.
    tracing::info!("http server drained; stopping components");
    runtime.shutdown(SHUTDOWN_GRACE).await;
    runtime.pool.close().await;
    tracing::info!("skalds controller shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
    }
}

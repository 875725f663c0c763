//! Composition root: wires adapters, stores, and loops together for the
//! selected run mode, tracks per-component liveness, and drains everything
//! in order on shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::dispatch::Dispatcher;
use crate::events::EventSink;
use crate::monitor::{SkaldMonitor, TaskMonitor};
use crate::reconcile::{Observation, Reconciler};
use crate::state::{SkaldStore, TaskStore};

/// Shutdown proceeds group by group in declaration order; the HTTP server is
/// drained by the binary before any of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ShutdownGroup {
    Dispatcher,
    Reconciler,
    Monitor,
}

struct Component {
    name: &'static str,
    details: String,
    group: ShutdownGroup,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Liveness row for `/api/system/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub name: &'static str,
    pub running: bool,
    pub details: String,
}

/// Adapter reachability for `/api/system/health`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdapterHealth {
    pub cache: bool,
    pub store: bool,
    pub event: bool,
}

impl AdapterHealth {
    pub fn all_healthy(&self) -> bool {
        self.cache && self.store && self.event
    }
}

/// Everything a running controller process shares between its loops and the
/// HTTP layer.
pub struct Runtime {
    pub config: ControllerConfig,
    pub pool: PgPool,
    pub cache: Arc<dyn CacheStore>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub skalds: Arc<SkaldStore>,
    pub tasks: Arc<TaskStore>,
    pub reconciler: Arc<Reconciler>,
    components: Mutex<Vec<Component>>,
}

impl Runtime {
    pub fn new(
        config: ControllerConfig,
        pool: PgPool,
        cache: Arc<dyn CacheStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let skalds = SkaldStore::new(config.sse_backpressure_high);
        let tasks = TaskStore::new(config.sse_backpressure_high);
        let reconciler = Reconciler::new(
            pool.clone(),
            events.clone(),
            clock.clone(),
            config.assignment_timeout,
        );

        Arc::new(Self {
            config,
            pool,
            cache,
            events,
            clock,
            skalds,
            tasks,
            reconciler,
            components: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the loops for the configured run mode. Controller mode runs no
    /// loops at all (API only); monitor mode adds both monitors and the
    /// reconciler; dispatcher mode adds the dispatcher on top.
    pub fn start(self: &Arc<Self>) {
        let mode = self.config.run_mode;
        info!(mode = %mode, "starting controller components");

        if mode.monitors_enabled() {
            let (obs_tx, obs_rx) = mpsc::channel::<Observation>(1024);

            let skald_token = CancellationToken::new();
            let skald_monitor = SkaldMonitor::new(
                self.cache.clone(),
                self.skalds.clone(),
                self.clock.clone(),
                &self.config,
            );
            self.push_component(
                "skald-monitor",
                format!("interval={:?}", self.config.skald_sync_interval),
                ShutdownGroup::Monitor,
                skald_token.clone(),
                tokio::spawn(skald_monitor.run(skald_token)),
            );

            let task_token = CancellationToken::new();
            let task_monitor = TaskMonitor::new(
                self.pool.clone(),
                self.cache.clone(),
                self.skalds.clone(),
                self.tasks.clone(),
                self.events.clone(),
                self.clock.clone(),
                obs_tx,
                &self.config,
            );
            self.push_component(
                "task-monitor",
                format!("interval={:?}", self.config.task_sync_interval),
                ShutdownGroup::Monitor,
                task_token.clone(),
                tokio::spawn(task_monitor.run(task_token)),
            );

            let reconcile_token = CancellationToken::new();
            self.push_component(
                "reconciler",
                format!("assignment_timeout={:?}", self.config.assignment_timeout),
                ShutdownGroup::Reconciler,
                reconcile_token.clone(),
                tokio::spawn(self.reconciler.clone().run(obs_rx, reconcile_token)),
            );
        }

        if mode.dispatcher_enabled() {
            let dispatch_token = CancellationToken::new();
            let dispatcher = Dispatcher::new(
                self.pool.clone(),
                self.skalds.clone(),
                self.events.clone(),
                self.clock.clone(),
                &self.config,
            );
            self.push_component(
                "dispatcher",
                format!(
                    "interval={:?} policy={}",
                    self.config.dispatch_interval, self.config.dispatch_policy
                ),
                ShutdownGroup::Dispatcher,
                dispatch_token.clone(),
                tokio::spawn(dispatcher.run(dispatch_token)),
            );
        }
    }

    fn push_component(
        &self,
        name: &'static str,
        details: String,
        group: ShutdownGroup,
        token: CancellationToken,
        handle: JoinHandle<()>,
    ) {
        self.components.lock().push(Component {
            name,
            details,
            group,
            token,
            handle,
        });
    }

    /// Per-component liveness, for the status endpoint.
    pub fn component_status(&self) -> Vec<ComponentStatus> {
        self.components
            .lock()
            .iter()
            .map(|c| ComponentStatus {
                name: c.name,
                running: !c.handle.is_finished(),
                details: c.details.clone(),
            })
            .collect()
    }

    /// Probe the three adapters with their built-in deadlines.
    pub async fn adapter_health(&self) -> AdapterHealth {
        AdapterHealth {
            cache: self.cache.ping().await,
            store: skalds_db::pool::ping(&self.pool).await,
            event: self.events.healthy().await,
        }
    }

    /// Drain all loops: dispatcher first, then reconciler, then monitors,
    /// each group bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let mut components = std::mem::take(&mut *self.components.lock());
        components.sort_by_key(|c| c.group);

        for mut component in components {
            component.token.cancel();
            match tokio::time::timeout(grace, &mut component.handle).await {
                Ok(Ok(())) => info!(component = component.name, "component stopped"),
                Ok(Err(e)) => warn!(component = component.name, error = %e, "component panicked"),
                Err(_) => {
                    warn!(component = component.name, "component did not stop within grace; aborting");
                    component.handle.abort();
                }
            }
        }
    }
}

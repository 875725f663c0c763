//! Task monitor: rebuilds the monitored-task view every `task_sync_interval`
//! and feeds observations to the reconciler.
//!
//! Also runs the orphan scan: a task id an executor claims to run but which
//! the store no longer monitors gets a broadcast `task.cancel`, rate-limited
//! per (skald, task) pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use skalds_db::models::LifecycleStatus;
use skalds_db::queries::tasks as task_db;

use crate::cache::{CacheStore, keys};
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::events::{EventSink, TaskEvent, topics};
use crate::reconcile::Observation;
use crate::state::{SkaldStatus, SkaldStore, TaskRecord, TaskStore};

pub struct TaskMonitor {
    pool: PgPool,
    cache: Arc<dyn CacheStore>,
    skalds: Arc<SkaldStore>,
    tasks: Arc<TaskStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    observations: mpsc::Sender<Observation>,
    sync_interval: Duration,
    stuck_window: usize,
    orphan_cancel_interval: Duration,
    /// Last cancel emission per (skald, task) orphan pair, epoch millis.
    orphan_sent: Mutex<HashMap<(String, String), i64>>,
}

impl TaskMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        cache: Arc<dyn CacheStore>,
        skalds: Arc<SkaldStore>,
        tasks: Arc<TaskStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        observations: mpsc::Sender<Observation>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            skalds,
            tasks,
            events,
            clock,
            observations,
            sync_interval: config.task_sync_interval,
            stuck_window: config.stuck_window,
            orphan_cancel_interval: config.orphan_cancel_interval,
            orphan_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Run cycles until shutdown. A failed cycle is logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.cycle().await {
                warn!(error = %e, "task monitor cycle failed");
            }
        }
        info!("task monitor stopped");
    }

    /// One full refresh of the monitored-task view plus the orphan scan.
    pub async fn cycle(&self) -> Result<()> {
        let monitored = task_db::list_monitored_tasks(&self.pool).await?;
        let now_ms = self.clock.epoch_ms();

        let mut monitored_ids: HashSet<String> = HashSet::with_capacity(monitored.len());

        for task in &monitored {
            monitored_ids.insert(task.id.clone());

            let heartbeat = match self.cache.get_string(&keys::task_heartbeat(&task.id)).await? {
                Some(raw) => match raw.parse::<i64>() {
                    Ok(hb) => Some(hb),
                    Err(_) => {
                        warn!(task_id = %task.id, value = %raw, "unparseable task heartbeat");
                        None
                    }
                },
                None => None,
            };
            let error = self
                .cache
                .get_string(&keys::task_error(&task.id))
                .await?
                .filter(|s| !s.is_empty());
            let exception = self
                .cache
                .get_string(&keys::task_exception(&task.id))
                .await?
                .filter(|s| !s.is_empty());

            let mut record = self.tasks.get(&task.id).unwrap_or_else(|| {
                TaskRecord::new(
                    task.id.clone(),
                    task.lifecycle_status,
                    task.executor.clone(),
                    now_ms,
                )
            });
            record.lifecycle_status = task.lifecycle_status;
            record.executor = task.executor.clone();
            if let Some(hb) = heartbeat {
                record.push_heartbeat(hb, self.stuck_window);
            }
            record.error = error;
            record.exception = exception.clone();
            record.updated_at_ms = now_ms;

            let history_saturated = record.lifecycle_status == LifecycleStatus::Running
                && record.history_saturated(self.stuck_window);

            self.tasks.upsert(record);

            // A monitored task must have an executor; one without is exactly
            // the inconsistency reconciliation exists for.
            let executor_online = if self.skalds.is_primed() {
                Some(task.executor.as_ref().is_some_and(|id| {
                    self.skalds
                        .get(id)
                        .is_some_and(|s| s.status == SkaldStatus::Online)
                }))
            } else {
                None
            };

            let assigning_for = if task.lifecycle_status == LifecycleStatus::Assigning {
                Duration::from_millis(
                    (now_ms - task.update_date_time.timestamp_millis()).max(0) as u64,
                )
            } else {
                Duration::ZERO
            };

            let obs = Observation {
                task_id: task.id.clone(),
                prev_status: task.lifecycle_status,
                heartbeat,
                history_saturated,
                exception,
                executor_online,
                assigning_for,
            };
            if self.observations.send(obs).await.is_err() {
                // Reconciler is gone; we are shutting down.
                return Ok(());
            }
        }

        // Drop records for tasks that left the monitored set.
        for id in self.tasks.ids() {
            if !monitored_ids.contains(&id) {
                self.tasks.remove(&id);
            }
        }

        self.orphan_scan(&monitored_ids, now_ms).await;
        Ok(())
    }

    /// Ask executors to release workers for tasks the store no longer tracks.
    async fn orphan_scan(&self, monitored_ids: &HashSet<String>, now_ms: i64) {
        let interval_ms = self.orphan_cancel_interval.as_millis() as i64;
        let mut live_pairs: HashSet<(String, String)> = HashSet::new();

        for skald in self.skalds.snapshot() {
            for task_id in &skald.current_tasks {
                if monitored_ids.contains(task_id) {
                    continue;
                }
                let pair = (skald.id.clone(), task_id.clone());
                live_pairs.insert(pair.clone());

                let due = {
                    let sent = self.orphan_sent.lock();
                    sent.get(&pair).is_none_or(|last| now_ms - last >= interval_ms)
                };
                if !due {
                    continue;
                }

                let event = TaskEvent::cancel(task_id, now_ms);
                match self.events.publish(topics::TASK_CANCEL, task_id, &event).await {
                    Ok(()) => {
                        info!(skald_id = %skald.id, task_id = %task_id, "orphan worker cancel requested");
                        self.orphan_sent.lock().insert(pair, now_ms);
                    }
                    Err(e) => {
                        warn!(skald_id = %skald.id, task_id = %task_id, error = %e, "orphan cancel publish failed");
                    }
                }
            }
        }

        // Pairs that stopped being orphans do not need their rate-limit state.
        self.orphan_sent.lock().retain(|pair, _| live_pairs.contains(pair));
    }
}

//! Reconciler: maps monitor observations onto lifecycle transitions.
//!
//! [`decide`] is a pure function of one observation; the surrounding
//! [`Reconciler`] worker applies decisions to the store with compare-and-set
//! writes (a losing CAS means another writer won the race and is treated as
//! success) and publishes control events where the transition calls for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skalds_db::models::LifecycleStatus;
use skalds_db::queries::tasks as task_db;

use crate::clock::Clock;
use crate::events::{EventSink, TaskEvent, topics};
use crate::state::task::{
    HEARTBEAT_CANCELLED, HEARTBEAT_EXCEPTION, HEARTBEAT_FINISHED, heartbeat_is_progress,
};

/// What one monitor cycle saw for one monitored task.
#[derive(Debug, Clone)]
pub struct Observation {
    pub task_id: String,
    /// Store status at the start of the cycle (`Assigning` or `Running`).
    pub prev_status: LifecycleStatus,
    pub heartbeat: Option<i64>,
    /// Whether the heartbeat window is full of identical samples.
    pub history_saturated: bool,
    pub exception: Option<String>,
    /// Fleet view of the task's executor. `None` until the skald monitor has
    /// completed its first cycle -- an empty fleet view means "no data yet",
    /// not "everything is down".
    pub executor_online: Option<bool>,
    /// How long the task has sat in `Assigning`, zero otherwise.
    pub assigning_for: Duration,
}

/// Why a task was failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Exception,
    Stuck,
    ExecutorOffline,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exception => "exception",
            Self::Stuck => "stuck",
            Self::ExecutorOffline => "executor_offline",
        }
    }
}

/// The lifecycle transition an observation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do this cycle.
    Hold,
    /// `Assigning -> Running`: the executor picked the task up.
    Start,
    /// `-> Finished`: heartbeat reported completion.
    Finish,
    /// `-> Failed`.
    Fail(FailReason),
    /// `-> Cancelled`: the worker acknowledged cancellation.
    CancelAck,
    /// `Assigning -> Created`: assignment timed out with no pickup.
    Demote,
}

/// Pure decision function. Terminal heartbeat values win over everything;
/// executor liveness is only consulted when the fleet view is primed.
pub fn decide(obs: &Observation, assignment_timeout: Duration) -> Decision {
    match obs.heartbeat {
        Some(HEARTBEAT_FINISHED) => return Decision::Finish,
        Some(HEARTBEAT_EXCEPTION) => return Decision::Fail(FailReason::Exception),
        Some(HEARTBEAT_CANCELLED) => return Decision::CancelAck,
        _ => {}
    }

    if obs.executor_online == Some(false) {
        return Decision::Fail(FailReason::ExecutorOffline);
    }

    match obs.heartbeat {
        Some(hb) if heartbeat_is_progress(hb) => {
            if obs.prev_status == LifecycleStatus::Assigning {
                Decision::Start
            } else if obs.history_saturated {
                Decision::Fail(FailReason::Stuck)
            } else {
                Decision::Hold
            }
        }
        Some(_) => {
            // Out-of-contract counter value; leave the task alone.
            Decision::Hold
        }
        None => {
            if obs.prev_status == LifecycleStatus::Assigning
                && obs.assigning_for > assignment_timeout
            {
                Decision::Demote
            } else {
                Decision::Hold
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Apply worker
// ---------------------------------------------------------------------------

/// Outcome of an externally requested status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// The transition was applied (and any event emitted).
    Applied,
    /// The task was already in the requested state; nothing emitted.
    NoOp,
    /// The transition is not legal from the task's current state.
    Invalid(LifecycleStatus),
    NotFound,
}

pub struct Reconciler {
    pool: PgPool,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    assignment_timeout: Duration,
    /// Assignment-timeout demotions since startup.
    demotions: AtomicU64,
}

impl Reconciler {
    pub fn new(
        pool: PgPool,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        assignment_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            events,
            clock,
            assignment_timeout,
            demotions: AtomicU64::new(0),
        })
    }

    /// Assignment-timeout demotion counter, for the metrics endpoint.
    pub fn demotion_count(&self) -> u64 {
        self.demotions.load(Ordering::Relaxed)
    }

    /// Consume observations until shutdown.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Observation>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                obs = rx.recv() => match obs {
                    Some(obs) => {
                        if let Err(e) = self.apply(&obs).await {
                            warn!(task_id = %obs.task_id, error = %e, "reconcile apply failed; will retry next cycle");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("reconciler drained");
    }

    /// Decide and write one observation.
    pub async fn apply(&self, obs: &Observation) -> Result<()> {
        let decision = decide(obs, self.assignment_timeout);
        match decision {
            Decision::Hold => {}
            Decision::Start => {
                let rows = task_db::transition_lifecycle(
                    &self.pool,
                    &obs.task_id,
                    &[LifecycleStatus::Assigning],
                    LifecycleStatus::Running,
                )
                .await?;
                if rows > 0 {
                    info!(task_id = %obs.task_id, "task started");
                } else {
                    debug!(task_id = %obs.task_id, "start CAS lost");
                }
            }
            Decision::Finish => {
                let rows = task_db::transition_lifecycle(
                    &self.pool,
                    &obs.task_id,
                    &LifecycleStatus::MONITORED,
                    LifecycleStatus::Finished,
                )
                .await?;
                if rows > 0 {
                    info!(task_id = %obs.task_id, "task finished");
                } else {
                    debug!(task_id = %obs.task_id, "finish CAS lost");
                }
            }
            Decision::Fail(reason) => {
                let rows = task_db::transition_lifecycle(
                    &self.pool,
                    &obs.task_id,
                    &LifecycleStatus::MONITORED,
                    LifecycleStatus::Failed,
                )
                .await?;
                if rows > 0 {
                    warn!(
                        task_id = %obs.task_id,
                        reason = reason.as_str(),
                        exception = obs.exception.as_deref().unwrap_or(""),
                        "task failed"
                    );
                } else {
                    debug!(task_id = %obs.task_id, "fail CAS lost");
                }
            }
            Decision::CancelAck => {
                let rows = task_db::transition_lifecycle(
                    &self.pool,
                    &obs.task_id,
                    &LifecycleStatus::MONITORED,
                    LifecycleStatus::Cancelled,
                )
                .await?;
                if rows > 0 {
                    info!(task_id = %obs.task_id, "task cancelled by worker");
                } else {
                    debug!(task_id = %obs.task_id, "cancel CAS lost");
                }
            }
            Decision::Demote => {
                let rows = task_db::demote_assigning(&self.pool, &obs.task_id).await?;
                if rows > 0 {
                    self.demotions.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %obs.task_id,
                        waited_ms = obs.assigning_for.as_millis() as u64,
                        "assignment timed out; task demoted to created"
                    );
                } else {
                    debug!(task_id = %obs.task_id, "demotion CAS lost");
                }
            }
        }
        Ok(())
    }

    /// External cancel (API `PUT /api/tasks/{id}/status {"status":"Cancelled"}`).
    ///
    /// Cancels from any non-terminal state and broadcasts one `task.cancel`
    /// event. Repeating the call against an already-cancelled task is a
    /// no-op: no second event, success to the caller.
    pub async fn external_cancel(&self, task_id: &str) -> Result<ControlOutcome> {
        let rows = task_db::transition_lifecycle(
            &self.pool,
            task_id,
            &[
                LifecycleStatus::Created,
                LifecycleStatus::Assigning,
                LifecycleStatus::Running,
                LifecycleStatus::Paused,
            ],
            LifecycleStatus::Cancelled,
        )
        .await?;

        if rows > 0 {
            let event = TaskEvent::cancel(task_id, self.clock.epoch_ms());
            if let Err(e) = self.events.publish(topics::TASK_CANCEL, task_id, &event).await {
                // The store transition already happened; the orphan scan will
                // re-issue cancellation to a fleet that still runs the task.
                warn!(task_id, error = %e, "cancel event publish failed");
            }
            info!(task_id, "task cancelled");
            return Ok(ControlOutcome::Applied);
        }

        match task_db::get_task(&self.pool, task_id).await? {
            None => Ok(ControlOutcome::NotFound),
            Some(t) if t.lifecycle_status == LifecycleStatus::Cancelled => {
                debug!(task_id, "cancel repeated on cancelled task");
                Ok(ControlOutcome::NoOp)
            }
            Some(t) => Ok(ControlOutcome::Invalid(t.lifecycle_status)),
        }
    }

    /// External re-queue (API `PUT ... {"status":"Created"}`): `Paused ->
    /// Created` so the dispatcher picks the task up again.
    pub async fn external_requeue(&self, task_id: &str) -> Result<ControlOutcome> {
        let rows = task_db::transition_lifecycle(
            &self.pool,
            task_id,
            &[LifecycleStatus::Paused],
            LifecycleStatus::Created,
        )
        .await?;

        if rows > 0 {
            info!(task_id, "task re-queued");
            return Ok(ControlOutcome::Applied);
        }

        match task_db::get_task(&self.pool, task_id).await? {
            None => Ok(ControlOutcome::NotFound),
            Some(t) if t.lifecycle_status == LifecycleStatus::Created => Ok(ControlOutcome::NoOp),
            Some(t) => Ok(ControlOutcome::Invalid(t.lifecycle_status)),
        }
    }

    /// Attachment update: persist the payload and notify the fleet.
    pub async fn external_update_attachments(
        &self,
        task_id: &str,
        attachments: &serde_json::Value,
    ) -> Result<ControlOutcome> {
        let rows = task_db::update_attachments(&self.pool, task_id, attachments).await?;
        if rows == 0 {
            return Ok(ControlOutcome::NotFound);
        }

        let event = TaskEvent::attachment_update(task_id, self.clock.epoch_ms());
        if let Err(e) = self
            .events
            .publish(topics::TASK_UPDATE_ATTACHMENT, task_id, &event)
            .await
        {
            warn!(task_id, error = %e, "attachment-update event publish failed");
        }
        Ok(ControlOutcome::Applied)
    }
}

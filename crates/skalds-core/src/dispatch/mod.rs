//! Dispatcher: assigns eligible `Created`/`Paused` passive tasks to eligible
//! skalds each tick.
//!
//! The assignment write is a single compare-and-set UPDATE that sets the
//! executor and moves the task to `Assigning` together, so a lost race
//! leaves no partial write. The assignment event publishes after the CAS;
//! if publication fails, the assignment-timeout demotion compensates.

pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skalds_db::queries::tasks as task_db;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::events::{EventSink, TaskEvent, topics};
use crate::state::SkaldStore;
use policy::{Candidate, DispatchPolicy, PolicyState};

/// Value written into the `initiator` field of assignment events.
const INITIATOR: &str = "system-controller";

pub struct Dispatcher {
    pool: PgPool,
    skalds: Arc<SkaldStore>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    policy: DispatchPolicy,
    interval: Duration,
    state: PolicyState,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        skalds: Arc<SkaldStore>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            pool,
            skalds,
            events,
            clock,
            policy: config.dispatch_policy,
            interval: config.dispatch_interval,
            state: PolicyState::new(),
        }
    }

    /// Run ticks until shutdown. A failed tick is logged and skipped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(0) => {}
                Ok(n) => info!(assigned = n, "dispatch tick complete"),
                Err(e) => warn!(error = %e, "dispatch tick failed"),
            }
        }
        info!("dispatcher stopped");
    }

    /// One dispatch pass. Returns the number of assignments made.
    pub async fn tick(&mut self) -> Result<usize> {
        let dispatchable = task_db::list_dispatchable_tasks(&self.pool).await?;
        if dispatchable.is_empty() {
            return Ok(0);
        }

        // Snapshot is sorted by id; policies rely on that for determinism.
        let fleet = self.skalds.snapshot();
        let now_ms = self.clock.epoch_ms();
        self.state.reseed(now_ms as u64);

        let mut tick_assignments: HashMap<String, usize> = HashMap::new();
        let mut assigned = 0usize;

        for task in &dispatchable {
            let candidates: Vec<Candidate> = fleet
                .iter()
                .filter(|s| s.dispatch_eligible(&task.class_name))
                .map(|s| Candidate {
                    id: s.id.clone(),
                    load: s.task_load() + tick_assignments.get(&s.id).copied().unwrap_or(0),
                })
                .collect();

            let Some(idx) = self.policy.choose(&mut self.state, &candidates) else {
                // No eligible skald; the task stays queued for the next tick.
                debug!(task_id = %task.id, class_name = %task.class_name, "no eligible skald");
                continue;
            };
            let skald_id = candidates[idx].id.clone();

            // Executor + status move in one CAS; rows == 0 means another
            // writer (or a parallel dispatcher) won and nothing was written.
            let rows = task_db::assign_for_dispatch(&self.pool, &task.id, &skald_id).await?;
            if rows == 0 {
                debug!(task_id = %task.id, "assignment CAS lost");
                continue;
            }

            let event = TaskEvent::assign(&task.id, &skald_id, INITIATOR, now_ms);
            if let Err(e) = self
                .events
                .publish(topics::TASK_ASSIGN, &task.id, &event)
                .await
            {
                // The task is already Assigning; with no pickup the
                // assignment timeout will demote it back to Created.
                warn!(task_id = %task.id, skald_id = %skald_id, error = %e, "assign event publish failed");
            } else {
                info!(task_id = %task.id, skald_id = %skald_id, "task assigned");
            }

            *tick_assignments.entry(skald_id).or_insert(0) += 1;
            assigned += 1;
        }

        Ok(assigned)
    }
}

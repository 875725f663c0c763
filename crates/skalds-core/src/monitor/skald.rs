//! Skald monitor: rebuilds the fleet view from the cache every
//! `skald_sync_interval`.
//!
//! A skald whose last-active timestamp is past the stale threshold is marked
//! OFFLINE eagerly, without any per-id reads. A skald whose heartbeat ring
//! flatlines is forced OFFLINE even when its registry timestamp is fresh
//! (a hung executor that still touches the registry).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, keys};
use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::state::{SkaldKind, SkaldRecord, SkaldStatus, SkaldStore};

pub struct SkaldMonitor {
    cache: Arc<dyn CacheStore>,
    skalds: Arc<SkaldStore>,
    clock: Arc<dyn Clock>,
    sync_interval: Duration,
    stale_threshold: Duration,
    evict_threshold: Duration,
    stuck_window: usize,
}

impl SkaldMonitor {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        skalds: Arc<SkaldStore>,
        clock: Arc<dyn Clock>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cache,
            skalds,
            clock,
            sync_interval: config.skald_sync_interval,
            stale_threshold: config.skald_stale_threshold,
            evict_threshold: config.skald_evict_threshold,
            stuck_window: config.stuck_window,
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
                warn!(error = %e, "skald monitor cycle failed");
            }
        }
        info!("skald monitor stopped");
    }

    /// One full rebuild of the fleet view.
    pub async fn cycle(&self) -> Result<()> {
        let registry = self.cache.get_all_hash_fields(keys::SKALD_REGISTRY).await?;
        let modes = self.cache.get_all_hash_fields(keys::SKALD_MODE).await?;
        let now_ms = self.clock.epoch_ms();
        let stale_ms = self.stale_threshold.as_millis() as i64;

        for (id, last_active_raw) in &registry {
            let Ok(last_active_ms) = last_active_raw.parse::<i64>() else {
                warn!(skald_id = %id, value = %last_active_raw, "unparseable last-active timestamp");
                continue;
            };

            // Executors that never wrote a mode are treated as edge: absent
            // data must not make a skald dispatch-eligible.
            let kind = modes
                .get(id)
                .and_then(|m| SkaldKind::from_str(m).ok())
                .unwrap_or(SkaldKind::Edge);

            let mut record = self
                .skalds
                .get(id)
                .unwrap_or_else(|| SkaldRecord::new(id.clone(), kind, now_ms));
            record.kind = kind;
            record.last_active_ms = last_active_ms;
            record.registry_seen_ms = now_ms;

            let stale = now_ms - last_active_ms > stale_ms;
            if stale {
                // Eager OFFLINE without further network I/O.
                record.status = SkaldStatus::Offline;
                self.skalds.upsert(record);
                continue;
            }

            if let Some(hb) = self.cache.get_string(&keys::skald_heartbeat(id)).await? {
                match hb.parse::<i64>() {
                    Ok(hb) => record.push_heartbeat(hb, self.stuck_window),
                    Err(_) => {
                        warn!(skald_id = %id, value = %hb, "unparseable skald heartbeat")
                    }
                }
            }
            record.supported_task_types = self
                .cache
                .read_list(&keys::skald_allowed_classes(id), 0, -1)
                .await?
                .into_iter()
                .collect();
            record.current_tasks = self
                .cache
                .read_list(&keys::skald_all_tasks(id), 0, -1)
                .await?
                .into_iter()
                .collect();

            record.derive_status(now_ms, stale_ms, self.stuck_window);
            self.skalds.upsert(record);
        }

        // Records absent from the registry: offline immediately, evicted
        // after a prolonged absence.
        let evict_ms = self.evict_threshold.as_millis() as i64;
        for id in self.skalds.ids() {
            if registry.contains_key(&id) {
                continue;
            }
            let Some(record) = self.skalds.get(&id) else {
                continue;
            };
            if now_ms - record.registry_seen_ms > evict_ms {
                debug!(skald_id = %id, "evicting skald absent from registry");
                self.skalds.remove(&id);
            } else if record.status != SkaldStatus::Offline {
                self.skalds.merge(&id, |r| r.status = SkaldStatus::Offline);
            }
        }

        self.skalds.mark_primed();
        Ok(())
    }
}

//! Monitored-task records: the live view of every `Assigning`/`Running`
//! task, merging store truth with the volatile cache fields.

use std::collections::VecDeque;

use serde::Serialize;

use skalds_db::models::LifecycleStatus;

/// Terminal-ok heartbeat value: the worker completed.
pub const HEARTBEAT_FINISHED: i64 = 200;
/// Terminal-fail heartbeat value: the worker raised.
pub const HEARTBEAT_EXCEPTION: i64 = -1;
/// Terminal-cancel heartbeat value: the worker acknowledged cancellation.
pub const HEARTBEAT_CANCELLED: i64 = -2;

/// Whether a heartbeat counter signals normal progress.
pub fn heartbeat_is_progress(heartbeat: i64) -> bool {
    (0..HEARTBEAT_FINISHED).contains(&heartbeat)
}

/// One monitored task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub lifecycle_status: LifecycleStatus,
    pub executor: Option<String>,
    /// Last heartbeat counter read from the cache, if any yet.
    pub heartbeat: Option<i64>,
    pub error: Option<String>,
    pub exception: Option<String>,
    /// Sliding window of heartbeat samples, newest last.
    pub heartbeat_history: VecDeque<i64>,
    /// When the record was last refreshed, epoch millis.
    pub updated_at_ms: i64,
}

impl TaskRecord {
    pub fn new(
        id: String,
        lifecycle_status: LifecycleStatus,
        executor: Option<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            lifecycle_status,
            executor,
            heartbeat: None,
            error: None,
            exception: None,
            heartbeat_history: VecDeque::new(),
            updated_at_ms: now_ms,
        }
    }

    /// Append a heartbeat sample, keeping the window at `window` entries.
    pub fn push_heartbeat(&mut self, heartbeat: i64, window: usize) {
        self.heartbeat = Some(heartbeat);
        self.heartbeat_history.push_back(heartbeat);
        while self.heartbeat_history.len() > window {
            self.heartbeat_history.pop_front();
        }
    }

    /// Whether the window is full and every sample is identical -- the stuck
    /// condition.
    pub fn history_saturated(&self, window: usize) -> bool {
        self.heartbeat_history.len() >= window
            && self
                .heartbeat_history
                .iter()
                .all(|&h| h == self.heartbeat_history[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 5;

    fn record() -> TaskRecord {
        TaskRecord::new("t1".to_owned(), LifecycleStatus::Running, Some("s1".to_owned()), 0)
    }

    #[test]
    fn progress_range_boundaries() {
        assert!(heartbeat_is_progress(0));
        assert!(heartbeat_is_progress(199));
        assert!(!heartbeat_is_progress(200));
        assert!(!heartbeat_is_progress(-1));
        assert!(!heartbeat_is_progress(-2));
    }

    #[test]
    fn history_window_is_bounded() {
        let mut r = record();
        for i in 0..8 {
            r.push_heartbeat(i, WINDOW);
        }
        assert_eq!(r.heartbeat_history.len(), WINDOW);
        assert_eq!(r.heartbeat, Some(7));
    }

    #[test]
    fn saturated_only_when_full_and_equal() {
        let mut r = record();
        for _ in 0..4 {
            r.push_heartbeat(42, WINDOW);
        }
        assert!(!r.history_saturated(WINDOW));

        r.push_heartbeat(42, WINDOW);
        assert!(r.history_saturated(WINDOW));
    }

    #[test]
    fn varied_history_is_not_saturated() {
        let mut r = record();
        for h in [50, 50, 51, 50, 50] {
            r.push_heartbeat(h, WINDOW);
        }
        assert!(!r.history_saturated(WINDOW));
    }
}

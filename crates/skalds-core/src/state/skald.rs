//! Fleet records: one per registered skald, in-memory only, rebuilt from the
//! cache every monitor cycle and never persisted.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Deployment kind of a skald. Only `Node` executors are dispatch-eligible;
/// `Edge` executors load their workers from a local bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkaldKind {
    Node,
    Edge,
}

impl fmt::Display for SkaldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Node => "Node",
            Self::Edge => "Edge",
        };
        f.write_str(s)
    }
}

impl FromStr for SkaldKind {
    type Err = SkaldKindParseError;

    /// Case-insensitive: executors write lowercase into the mode hash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" => Ok(Self::Node),
            "edge" => Ok(Self::Edge),
            other => Err(SkaldKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SkaldKind`] string.
#[derive(Debug, Clone)]
pub struct SkaldKindParseError(pub String);

impl fmt::Display for SkaldKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid skald kind: {:?}", self.0)
    }
}

impl std::error::Error for SkaldKindParseError {}

/// Derived liveness of a skald. Never written directly; recomputed from
/// last-active age and the heartbeat ring every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkaldStatus {
    Online,
    Offline,
}

impl fmt::Display for SkaldStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
        };
        f.write_str(s)
    }
}

/// One fleet member.
#[derive(Debug, Clone, Serialize)]
pub struct SkaldRecord {
    pub id: String,
    pub kind: SkaldKind,
    pub status: SkaldStatus,
    /// Last-active wall clock reported by the registry hash, epoch millis.
    pub last_active_ms: i64,
    /// Last heartbeat counter observed.
    pub heartbeat: i64,
    /// Recent heartbeat counters, bounded ring, newest last.
    pub heartbeat_history: VecDeque<i64>,
    /// Task class names this executor advertises.
    pub supported_task_types: BTreeSet<String>,
    /// Task ids the executor claims to be running.
    pub current_tasks: BTreeSet<String>,
    /// When this id was last present in the registry hash, epoch millis.
    /// Drives eviction after prolonged absence.
    #[serde(skip)]
    pub registry_seen_ms: i64,
}

impl SkaldRecord {
    pub fn new(id: String, kind: SkaldKind, now_ms: i64) -> Self {
        Self {
            id,
            kind,
            status: SkaldStatus::Offline,
            last_active_ms: now_ms,
            heartbeat: 0,
            heartbeat_history: VecDeque::new(),
            supported_task_types: BTreeSet::new(),
            current_tasks: BTreeSet::new(),
            registry_seen_ms: now_ms,
        }
    }

    /// Append a heartbeat sample, keeping the ring at `window` entries.
    pub fn push_heartbeat(&mut self, heartbeat: i64, window: usize) {
        self.heartbeat = heartbeat;
        self.heartbeat_history.push_back(heartbeat);
        while self.heartbeat_history.len() > window {
            self.heartbeat_history.pop_front();
        }
    }

    /// Whether the last `window` samples are present and all equal -- a hung
    /// executor that still refreshes its registry timestamp.
    pub fn heartbeat_flatlined(&self, window: usize) -> bool {
        self.heartbeat_history.len() >= window
            && self
                .heartbeat_history
                .iter()
                .all(|&h| h == self.heartbeat_history[0])
    }

    /// Recompute the derived status: ONLINE iff the last-active timestamp is
    /// within the stale threshold and the heartbeat ring is not flatlined.
    pub fn derive_status(&mut self, now_ms: i64, stale_threshold_ms: i64, window: usize) {
        let fresh = now_ms - self.last_active_ms <= stale_threshold_ms;
        self.status = if fresh && !self.heartbeat_flatlined(window) {
            SkaldStatus::Online
        } else {
            SkaldStatus::Offline
        };
    }

    /// Whether this skald may appear in dispatch candidate sets for a task
    /// of the given class.
    pub fn dispatch_eligible(&self, class_name: &str) -> bool {
        self.kind == SkaldKind::Node
            && self.status == SkaldStatus::Online
            && self.supported_task_types.contains(class_name)
    }

    /// Current task-load used by the least-tasks policy.
    pub fn task_load(&self) -> usize {
        self.current_tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: usize = 5;
    const STALE_MS: i64 = 15_000;

    fn record() -> SkaldRecord {
        SkaldRecord::new("s1".to_owned(), SkaldKind::Node, 100_000)
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("node".parse::<SkaldKind>().ok(), Some(SkaldKind::Node));
        assert_eq!("Edge".parse::<SkaldKind>().ok(), Some(SkaldKind::Edge));
        assert!("cloud".parse::<SkaldKind>().is_err());
    }

    #[test]
    fn heartbeat_ring_is_bounded() {
        let mut r = record();
        for i in 0..10 {
            r.push_heartbeat(i, WINDOW);
        }
        assert_eq!(r.heartbeat_history.len(), WINDOW);
        assert_eq!(r.heartbeat_history, VecDeque::from(vec![5, 6, 7, 8, 9]));
        assert_eq!(r.heartbeat, 9);
    }

    #[test]
    fn fresh_and_varied_heartbeats_are_online() {
        let mut r = record();
        for i in 0..5 {
            r.push_heartbeat(i, WINDOW);
        }
        r.derive_status(100_000 + STALE_MS, STALE_MS, WINDOW);
        assert_eq!(r.status, SkaldStatus::Online);
    }

    #[test]
    fn one_millisecond_past_stale_threshold_is_offline() {
        let mut r = record();
        r.push_heartbeat(1, WINDOW);
        r.derive_status(100_000 + STALE_MS + 1, STALE_MS, WINDOW);
        assert_eq!(r.status, SkaldStatus::Offline);
    }

    #[test]
    fn flatlined_heartbeats_force_offline_even_when_fresh() {
        let mut r = record();
        for _ in 0..5 {
            r.push_heartbeat(42, WINDOW);
        }
        r.derive_status(100_000, STALE_MS, WINDOW);
        assert_eq!(r.status, SkaldStatus::Offline);
    }

    #[test]
    fn short_flat_history_is_not_flatlined() {
        let mut r = record();
        for _ in 0..4 {
            r.push_heartbeat(42, WINDOW);
        }
        assert!(!r.heartbeat_flatlined(WINDOW));
        r.derive_status(100_000, STALE_MS, WINDOW);
        assert_eq!(r.status, SkaldStatus::Online);
    }

    #[test]
    fn varied_window_is_not_flatlined() {
        let mut r = record();
        for h in [50, 50, 51, 50, 50] {
            r.push_heartbeat(h, WINDOW);
        }
        assert!(!r.heartbeat_flatlined(WINDOW));
    }

    #[test]
    fn dispatch_eligibility_requires_node_online_and_class() {
        let mut r = record();
        r.supported_task_types.insert("W".to_owned());
        r.status = SkaldStatus::Online;
        assert!(r.dispatch_eligible("W"));
        assert!(!r.dispatch_eligible("X"));

        r.status = SkaldStatus::Offline;
        assert!(!r.dispatch_eligible("W"));

        r.status = SkaldStatus::Online;
        r.kind = SkaldKind::Edge;
        assert!(!r.dispatch_eligible("W"));
    }
}

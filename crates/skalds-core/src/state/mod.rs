//! In-memory state stores: the controller's authoritative live view.
//!
//! Two concurrent maps -- [`SkaldStore`] (fleet) and [`TaskStore`]
//! (monitored tasks). The monitors are the only writers; dispatcher,
//! reconciler, event fanout, and the query API read copy-on-read snapshots.
//! Every record change is fanned out on a broadcast channel, which is the
//! subscription hook the SSE layer consumes.

pub mod skald;
pub mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

pub use skald::{SkaldKind, SkaldRecord, SkaldStatus};
pub use task::TaskRecord;

/// A change to a skald record.
#[derive(Debug, Clone)]
pub enum SkaldChange {
    Updated(SkaldRecord),
    Removed(String),
}

/// A change to a monitored-task record.
#[derive(Debug, Clone)]
pub enum TaskChange {
    Updated(TaskRecord),
    Removed(String),
}

macro_rules! impl_store {
    ($store:ident, $record:ty, $change:ident) => {
        impl $store {
            /// Replace (or insert) a whole record, notifying subscribers.
            pub fn upsert(&self, record: $record) {
                self.inner.write().insert(record.id.clone(), record.clone());
                let _ = self.changes.send($change::Updated(record));
            }

            /// Mutate one record in place under the store lock. Returns false
            /// when the id is absent (nothing is notified).
            pub fn merge(&self, id: &str, f: impl FnOnce(&mut $record)) -> bool {
                let updated = {
                    let mut inner = self.inner.write();
                    match inner.get_mut(id) {
                        Some(record) => {
                            f(record);
                            Some(record.clone())
                        }
                        None => None,
                    }
                };
                match updated {
                    Some(record) => {
                        let _ = self.changes.send($change::Updated(record));
                        true
                    }
                    None => false,
                }
            }

            /// Remove a record, notifying subscribers when it existed.
            pub fn remove(&self, id: &str) -> bool {
                let removed = self.inner.write().remove(id).is_some();
                if removed {
                    let _ = self.changes.send($change::Removed(id.to_owned()));
                }
                removed
            }

            pub fn get(&self, id: &str) -> Option<$record> {
                self.inner.read().get(id).cloned()
            }

            /// Copy-on-read snapshot of every record, sorted by id for
            /// deterministic iteration.
            pub fn snapshot(&self) -> Vec<$record> {
                let mut records: Vec<$record> = self.inner.read().values().cloned().collect();
                records.sort_by(|a, b| a.id.cmp(&b.id));
                records
            }

            pub fn ids(&self) -> Vec<String> {
                self.inner.read().keys().cloned().collect()
            }

            pub fn len(&self) -> usize {
                self.inner.read().len()
            }

            pub fn is_empty(&self) -> bool {
                self.inner.read().is_empty()
            }

            /// Subscribe to record changes. A receiver that falls more than
            /// the channel capacity behind observes a `Lagged` error, which
            /// the SSE layer turns into a slow-consumer close.
            pub fn subscribe(&self) -> broadcast::Receiver<$change> {
                self.changes.subscribe()
            }
        }
    };
}

/// Fleet view, keyed by skald id. Written by the skald monitor.
pub struct SkaldStore {
    inner: RwLock<HashMap<String, SkaldRecord>>,
    changes: broadcast::Sender<SkaldChange>,
    primed: AtomicBool,
}

impl SkaldStore {
    pub fn new(change_capacity: usize) -> Arc<Self> {
        let (changes, _) = broadcast::channel(change_capacity);
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            changes,
            primed: AtomicBool::new(false),
        })
    }

    /// Mark that at least one full monitor cycle has completed. Until then
    /// the fleet view is empty for lack of data, not because the fleet is
    /// down, and the reconciler must not fail tasks over it.
    pub fn mark_primed(&self) {
        self.primed.store(true, Ordering::Release);
    }

    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }
}

impl_store!(SkaldStore, SkaldRecord, SkaldChange);

/// Monitored-task view, keyed by task id. Written by the task monitor.
pub struct TaskStore {
    inner: RwLock<HashMap<String, TaskRecord>>,
    changes: broadcast::Sender<TaskChange>,
}

impl TaskStore {
    pub fn new(change_capacity: usize) -> Arc<Self> {
        let (changes, _) = broadcast::channel(change_capacity);
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            changes,
        })
    }
}

impl_store!(TaskStore, TaskRecord, TaskChange);

#[cfg(test)]
mod tests {
    use super::*;

    fn skald(id: &str) -> SkaldRecord {
        SkaldRecord::new(id.to_owned(), SkaldKind::Node, 0)
    }

    #[test]
    fn upsert_get_snapshot() {
        let store = SkaldStore::new(16);
        store.upsert(skald("b"));
        store.upsert(skald("a"));

        assert_eq!(store.len(), 2);
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_none());

        let ids: Vec<String> = store.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn merge_mutates_existing_only() {
        let store = SkaldStore::new(16);
        store.upsert(skald("a"));

        assert!(store.merge("a", |r| r.heartbeat = 7));
        assert_eq!(store.get("a").map(|r| r.heartbeat), Some(7));
        assert!(!store.merge("missing", |r| r.heartbeat = 7));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = SkaldStore::new(16);
        store.upsert(skald("a"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_updates_and_removals() {
        let store = SkaldStore::new(16);
        let mut rx = store.subscribe();

        store.upsert(skald("a"));
        store.remove("a");

        match rx.recv().await.expect("update event") {
            SkaldChange::Updated(record) => assert_eq!(record.id, "a"),
            other => panic!("expected update, got {other:?}"),
        }
        match rx.recv().await.expect("remove event") {
            SkaldChange::Removed(id) => assert_eq!(id, "a"),
            other => panic!("expected removal, got {other:?}"),
        }
    }

    #[test]
    fn primed_flag_latches() {
        let store = SkaldStore::new(16);
        assert!(!store.is_primed());
        store.mark_primed();
        assert!(store.is_primed());
    }

    #[test]
    fn snapshot_is_a_copy() {
        let store = TaskStore::new(16);
        store.upsert(TaskRecord::new(
            "t1".to_owned(),
            skalds_db::models::LifecycleStatus::Running,
            Some("s1".to_owned()),
            0,
        ));

        let snap = store.snapshot();
        store.merge("t1", |r| r.heartbeat = Some(50));

        // The earlier snapshot is unaffected by later writes.
        assert_eq!(snap[0].heartbeat, None);
    }
}

//! Cache key layout. Executors write these keys; the controller reads them.

/// Fleet registry hash: field = skald id, value = last-active epoch millis.
pub const SKALD_REGISTRY: &str = "skalds:hash";

/// Mode hash: field = skald id, value = kind (`node` / `edge`).
pub const SKALD_MODE: &str = "skalds:mode:hash";

/// Per-skald heartbeat counter (string, integer).
pub fn skald_heartbeat(skald_id: &str) -> String {
    format!("skalds:{skald_id}:heartbeat")
}

/// Per-skald list of supported task class names.
pub fn skald_allowed_classes(skald_id: &str) -> String {
    format!("skalds:{skald_id}:allow-task-class-name")
}

/// Per-skald list of task ids the executor claims to be running.
pub fn skald_all_tasks(skald_id: &str) -> String {
    format!("skalds:{skald_id}:all-task")
}

/// Per-task heartbeat counter (string, integer).
pub fn task_heartbeat(task_id: &str) -> String {
    format!("task:{task_id}:heartbeat")
}

/// Per-task error string (empty = none).
pub fn task_error(task_id: &str) -> String {
    format!("task:{task_id}:has-error")
}

/// Per-task exception string (empty = none).
pub fn task_exception(task_id: &str) -> String {
    format!("task:{task_id}:exception")
}

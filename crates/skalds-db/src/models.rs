use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task -- the authoritative state machine lives in the
/// store, and every transition is a compare-and-set against the previous
/// status.
///
/// ```text
/// created   -> assigning   (dispatcher picks the task, sets executor)
/// assigning -> running     (executor reports a heartbeat in 0..=199)
/// assigning -> created     (assignment timeout; executor cleared)
/// running   -> finished    (heartbeat 200)
/// running   -> failed      (heartbeat -1, stuck window, executor offline)
/// running   -> cancelled   (heartbeat -2, external cancel)
/// paused    -> created     (external re-queue)
/// any non-terminal -> cancelled  (external cancel)
/// ```
///
/// `finished`, `failed`, and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum LifecycleStatus {
    Created,
    Assigning,
    Running,
    Paused,
    Finished,
    Failed,
    Cancelled,
}

impl LifecycleStatus {
    /// Statuses watched by the task monitor.
    pub const MONITORED: [LifecycleStatus; 2] = [Self::Assigning, Self::Running];

    /// Statuses eligible for dispatch (mode permitting).
    pub const DISPATCHABLE: [LifecycleStatus; 2] = [Self::Created, Self::Paused];

    /// Whether this status is terminal (never re-dispatched).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Assigning => "Assigning",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Finished => "Finished",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for LifecycleStatus {
    type Err = LifecycleStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "Assigning" => Ok(Self::Assigning),
            "Running" => Ok(Self::Running),
            "Paused" => Ok(Self::Paused),
            "Finished" => Ok(Self::Finished),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(LifecycleStatusParseError(other.to_owned())),
        }
    }
}

impl LifecycleStatus {
    /// The snake_case form stored in the database `text` column.
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Assigning => "assigning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Error returned when parsing an invalid [`LifecycleStatus`] string.
#[derive(Debug, Clone)]
pub struct LifecycleStatusParseError(pub String);

impl fmt::Display for LifecycleStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid lifecycle status: {:?}", self.0)
    }
}

impl std::error::Error for LifecycleStatusParseError {}

// ---------------------------------------------------------------------------

/// Run mode of a task.
///
/// Only `Passive` tasks flow through the dispatcher. `Active` tasks are loaded
/// by an executor from a local bundle, and `PassiveProcess` tasks run outside
/// the orchestrator entirely (the controller stores but never tracks them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskMode {
    Active,
    Passive,
    PassiveProcess,
}

impl TaskMode {
    /// Whether tasks in this mode may be picked up by the dispatcher.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Passive)
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "Active",
            Self::Passive => "Passive",
            Self::PassiveProcess => "PassiveProcess",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskMode {
    type Err = TaskModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Active" => Ok(Self::Active),
            "Passive" => Ok(Self::Passive),
            "PassiveProcess" => Ok(Self::PassiveProcess),
            other => Err(TaskModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskMode`] string.
#[derive(Debug, Clone)]
pub struct TaskModeParseError(pub String);

impl fmt::Display for TaskModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task mode: {:?}", self.0)
    }
}

impl std::error::Error for TaskModeParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the persisted unit of work.
///
/// The volatile runtime fields (heartbeat, error, exception) live in the
/// cache, not here; the monitor merges them into its in-memory view.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub class_name: String,
    pub source: String,
    pub executor: Option<String>,
    pub dependencies: Option<Vec<String>>,
    pub mode: TaskMode,
    pub lifecycle_status: LifecycleStatus,
    pub priority: i32,
    pub attachments: Option<serde_json::Value>,
    /// Only interpreted in `PassiveProcess` mode; opaque to the controller.
    pub is_persistent: bool,
    pub create_date_time: DateTime<Utc>,
    pub update_date_time: DateTime<Utc>,
    pub deadline_date_time: Option<DateTime<Utc>>,
}

/// Insert payload for [`crate::queries::tasks::create_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub class_name: String,
    pub source: String,
    pub dependencies: Option<Vec<String>>,
    pub mode: TaskMode,
    pub priority: i32,
    pub attachments: Option<serde_json::Value>,
    pub is_persistent: bool,
    pub deadline_date_time: Option<DateTime<Utc>>,
}

impl NewTask {
    /// A minimal passive task with defaults, handy in tests and tools.
    pub fn passive(id: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class_name: class_name.into(),
            source: String::new(),
            dependencies: None,
            mode: TaskMode::Passive,
            priority: 0,
            attachments: None,
            is_persistent: false,
            deadline_date_time: None,
        }
    }
}

/// Filter for [`crate::queries::tasks::list_tasks`]. Empty filter matches all.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<LifecycleStatus>,
    pub class_name: Option<String>,
    pub executor: Option<String>,
    pub id: Option<String>,
}

/// Task counts by lifecycle status, for summaries and metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusCounts {
    pub created: i64,
    pub assigning: i64,
    pub running: i64,
    pub paused: i64,
    pub finished: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

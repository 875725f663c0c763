//! Event adapter: at-least-once producer onto the partitioned control-event
//! log. The message key is always the single task id, so per-task order is
//! preserved within each topic partition. The controller only produces;
//! consumers are the executors, expected to be idempotent on
//! `(task_id, updateDateTime)`.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::kafka::KafkaEventSink;
pub use self::memory::MemoryEventSink;

/// Topic names.
pub mod topics {
    /// Dispatcher -> skalds, targeted by `recipient`.
    pub const TASK_ASSIGN: &str = "task.assign";
    /// Controller -> all skalds; executors ignore ids they do not own.
    pub const TASK_CANCEL: &str = "task.cancel";
    /// Controller -> skalds, parameter hot-update notification.
    pub const TASK_UPDATE_ATTACHMENT: &str = "task.update.attachment";
}

/// Error kind for event publication. Transient; callers log and rely on the
/// next cycle (or the assignment-timeout compensation) to recover.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event publish timed out")]
    Timeout,
    #[error("event backend error: {0}")]
    Backend(String),
}

/// The JSON payload carried on every task control topic. Timestamps are
/// epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_date_time: Option<i64>,
    pub update_date_time: i64,
}

impl TaskEvent {
    /// Assignment event for one task, targeted at one skald.
    pub fn assign(task_id: &str, recipient: &str, initiator: &str, now_ms: i64) -> Self {
        Self {
            task_ids: vec![task_id.to_owned()],
            recipient: Some(recipient.to_owned()),
            initiator: Some(initiator.to_owned()),
            create_date_time: Some(now_ms),
            update_date_time: now_ms,
        }
    }

    /// Cancellation event for one task, broadcast to the fleet.
    pub fn cancel(task_id: &str, now_ms: i64) -> Self {
        Self {
            task_ids: vec![task_id.to_owned()],
            recipient: None,
            initiator: None,
            create_date_time: Some(now_ms),
            update_date_time: now_ms,
        }
    }

    /// Attachment-update notification for one task.
    pub fn attachment_update(task_id: &str, now_ms: i64) -> Self {
        Self {
            task_ids: vec![task_id.to_owned()],
            recipient: None,
            initiator: None,
            create_date_time: None,
            update_date_time: now_ms,
        }
    }
}

/// Producer onto named topics with a routing key.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, event: &TaskEvent) -> Result<(), EventError>;

    /// Cheap reachability probe for the health endpoint.
    async fn healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_payload_shape() {
        let event = TaskEvent::assign("t1", "s1", "dispatcher", 1_000);
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["taskIds"], serde_json::json!(["t1"]));
        assert_eq!(json["recipient"], "s1");
        assert_eq!(json["initiator"], "dispatcher");
        assert_eq!(json["createDateTime"], 1_000);
        assert_eq!(json["updateDateTime"], 1_000);
    }

    #[test]
    fn cancel_payload_omits_recipient() {
        let event = TaskEvent::cancel("t1", 2_000);
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["taskIds"], serde_json::json!(["t1"]));
        assert!(json.get("recipient").is_none());
        assert_eq!(json["updateDateTime"], 2_000);
    }

    #[test]
    fn attachment_update_payload_is_minimal() {
        let event = TaskEvent::attachment_update("t1", 3_000);
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json.get("createDateTime").is_none());
        assert_eq!(json["updateDateTime"], 3_000);
    }
}

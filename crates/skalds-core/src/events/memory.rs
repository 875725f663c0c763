//! In-memory event sink that records published events, for tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EventError, EventSink, TaskEvent};

/// One recorded publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub topic: String,
    pub key: String,
    pub event: TaskEvent,
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far, in order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Drain and return everything published so far.
    pub fn take(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Events published to one topic, in order.
    pub fn for_topic(&self, topic: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, topic: &str, key: &str, event: &TaskEvent) -> Result<(), EventError> {
        self.events.lock().push(RecordedEvent {
            topic: topic.to_owned(),
            key: key.to_owned(),
            event: event.clone(),
        });
        Ok(())
    }

    async fn healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::topics;

    #[tokio::test]
    async fn records_in_publication_order() {
        let sink = MemoryEventSink::new();
        sink.publish(topics::TASK_CANCEL, "a", &TaskEvent::cancel("a", 1))
            .await
            .unwrap();
        sink.publish(topics::TASK_CANCEL, "b", &TaskEvent::cancel("b", 2))
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "a");
        assert_eq!(events[1].key, "b");

        assert_eq!(sink.for_topic(topics::TASK_ASSIGN).len(), 0);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.events().is_empty());
    }
}

//! Kafka-backed event sink using an `rdkafka` future producer.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;

use super::{EventError, EventSink, TaskEvent};
use crate::config::EventConfig;

pub struct KafkaEventSink {
    producer: FutureProducer,
    publish_timeout: Duration,
}

impl KafkaEventSink {
    /// Build a producer against the configured brokers.
    pub fn connect(config: &EventConfig) -> Result<Self, EventError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set(
                "message.timeout.ms",
                config.publish_timeout.as_millis().to_string(),
            )
            // At-least-once: retry on transient broker errors, ack from all
            // in-sync replicas.
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| EventError::Backend(e.to_string()))?;

        Ok(Self {
            producer,
            publish_timeout: config.publish_timeout,
        })
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, topic: &str, key: &str, event: &TaskEvent) -> Result<(), EventError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| EventError::Backend(e.to_string()))?;

        let record = FutureRecord::to(topic).key(key).payload(&payload);

        match self
            .producer
            .send(record, Timeout::After(self.publish_timeout))
            .await
        {
            Ok(_) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(EventError::Timeout)
            }
            Err((e, _)) => Err(EventError::Backend(e.to_string())),
        }
    }

    async fn healthy(&self) -> bool {
        let producer = self.producer.clone();
        let timeout = self.publish_timeout;
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

//! Kafka broker client and dead-letter topic.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use geobridge_core::{
    Ack, BrokerClient, CoordinateRecord, DeadLetterError, DeadLetterSink, FailureReason,
    PublishError, encode,
};
use rdkafka::{
    ClientConfig,
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    types::RDKafkaErrorCode,
    util::Timeout,
};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::error::{KafkaClientSnafu, Result};

const DEAD_LETTER_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes records with an idempotent producer that waits for all replicas.
#[derive(Clone)]
pub struct KafkaBroker {
    producer: FutureProducer,
}

/// Writes undeliverable records to a Kafka topic, with the failure in the
/// message headers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    source_topic: String,
}

fn producer(bootstrap_servers: &str) -> Result<FutureProducer> {
    ClientConfig::new()
        .set("bootstrap.servers", bootstrap_servers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("linger.ms", "5")
        .create()
        .context(KafkaClientSnafu {})
}

impl KafkaBroker {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

impl KafkaDeadLetterSink {
    pub fn new(
        producer: FutureProducer,
        topic: impl Into<String>,
        source_topic: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            source_topic: source_topic.into(),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn publish(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<Ack, PublishError> {
        let record = FutureRecord::to(topic).key(key).payload(payload.as_ref());

        match self.producer.send(record, Timeout::Never).await {
            Ok((partition, offset)) => Ok(Ack { partition, offset }),
            Err((err, _)) => Err(classify(err)),
        }
    }

    async fn flush(&self, timeout: Duration) -> usize {
        let producer = self.producer.clone();
        let remaining = tokio::task::spawn_blocking(move || {
            if let Err(err) = producer.flush(timeout) {
                debug!(err = %err, "kafka flush did not complete");
            }
            producer.in_flight_count()
        })
        .await;

        match remaining {
            Ok(count) => count.max(0) as usize,
            Err(err) => {
                warn!(err = %err, "kafka flush task failed");
                self.producer.in_flight_count().max(0) as usize
            }
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn dead_letter(
        &self,
        record: CoordinateRecord,
        reason: FailureReason,
    ) -> Result<(), DeadLetterError> {
        let payload = encode(&record);
        let key = record.key();
        let error = reason.to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dlq.reason",
                value: Some(reason.label()),
            })
            .insert(Header {
                key: "dlq.error",
                value: Some(error.as_str()),
            })
            .insert(Header {
                key: "dlq.topic",
                value: Some(self.source_topic.as_str()),
            });

        let message = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(payload.as_ref())
            .headers(headers);

        self.producer
            .send(message, DEAD_LETTER_SEND_TIMEOUT)
            .await
            .map(|_| ())
            .map_err(|(err, _)| DeadLetterError::new(err.to_string()))
    }
}

/// Errors the broker will keep returning for the same message are permanent.
fn classify(err: KafkaError) -> PublishError {
    let permanent = matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::InvalidMessageSize
                | RDKafkaErrorCode::InvalidRecord
                | RDKafkaErrorCode::TopicAuthorizationFailed
        )
    );

    if permanent {
        PublishError::permanent(err.to_string())
    } else {
        PublishError::transient(err.to_string())
    }
}

/// Builds the Kafka broker and dead-letter sink sharing one producer.
pub fn clients(
    bootstrap_servers: &str,
    dead_letter_topic: &str,
    topic: &str,
) -> Result<(Arc<KafkaBroker>, Arc<KafkaDeadLetterSink>)> {
    let producer = producer(bootstrap_servers)?;
    let broker = Arc::new(KafkaBroker::new(producer.clone()));
    let dead_letter = Arc::new(KafkaDeadLetterSink::new(producer, dead_letter_topic, topic));
    Ok((broker, dead_letter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(!classify(err).is_transient());

        let err = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert!(classify(err).is_transient());

        let err = KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut);
        assert!(classify(err).is_transient());
    }
}

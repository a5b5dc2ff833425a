//! Broker and dead-letter sink that only write to the log.
//!
//! Used to run the bridge locally without a broker.
use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use geobridge_core::{
    Ack, BrokerClient, CoordinateRecord, DeadLetterError, DeadLetterSink, FailureReason,
    PublishError,
};
use tracing::{info, warn};

/// Acknowledges every message, assigning offsets on a single partition.
#[derive(Debug, Default)]
pub struct LogBroker {
    next_offset: AtomicI64,
}

#[derive(Debug, Default)]
pub struct LogDeadLetterSink;

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BrokerClient for LogBroker {
    async fn publish(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<Ack, PublishError> {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);

        info!(
            topic,
            key = %String::from_utf8_lossy(key),
            offset,
            payload = %String::from_utf8_lossy(&payload),
            "published"
        );

        Ok(Ack {
            partition: 0,
            offset,
        })
    }

    async fn flush(&self, _timeout: Duration) -> usize {
        0
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn dead_letter(
        &self,
        record: CoordinateRecord,
        reason: FailureReason,
    ) -> Result<(), DeadLetterError> {
        warn!(
            source_id = %record.source_id(),
            reason = reason.label(),
            %record,
            "record dead-lettered: {}",
            reason
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use geobridge_core::SourceId;

    use super::*;

    #[tokio::test]
    async fn test_log_broker_assigns_sequential_offsets() {
        let broker = LogBroker::new();

        for expected in 0..3 {
            let ack = broker
                .publish("gpscoords", b"1", Bytes::from_static(b"{}"))
                .await
                .unwrap();
            assert_eq!(
                ack,
                Ack {
                    partition: 0,
                    offset: expected
                }
            );
        }

        assert_eq!(broker.flush(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn test_log_dead_letter_sink_accepts_records() {
        let record =
            CoordinateRecord::new(SourceId(7), 10.0, 20.0, SystemTime::UNIX_EPOCH).unwrap();

        LogDeadLetterSink
            .dead_letter(record, FailureReason::ShutdownDeadline)
            .await
            .unwrap();
    }
}

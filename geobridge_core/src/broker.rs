//! Interfaces to the systems downstream of the bridge.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

use crate::record::CoordinateRecord;

/// A client able to append messages to a broker topic.
///
/// Implementations report the outcome of each publish individually, so that
/// the publisher can decide what to retry.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish one message and wait for the broker acknowledgment.
    async fn publish(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<Ack, PublishError>;

    /// Wait for outstanding messages to be delivered.
    ///
    /// Returns the number of messages still in flight when the timeout expired.
    async fn flush(&self, timeout: Duration) -> usize;
}

/// Terminal destination for records that could not be delivered.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(
        &self,
        record: CoordinateRecord,
        reason: FailureReason,
    ) -> Result<(), DeadLetterError>;
}

/// Broker acknowledgment of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum PublishError {
    /// The broker could not take the message right now. Retrying may succeed.
    #[snafu(display("transient publish error: {message}"))]
    Transient { message: String },
    /// The broker rejected the message. Retrying will not help.
    #[snafu(display("permanent publish error: {message}"))]
    Permanent { message: String },
}

#[derive(Debug, Snafu)]
#[snafu(display("dead letter sink error: {message}"))]
pub struct DeadLetterError {
    pub message: String,
}

/// Why a record ended up in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The broker kept failing with transient errors.
    RetriesExhausted { attempts: u32, last_error: PublishError },
    /// The broker rejected the record.
    Permanent { error: PublishError },
    /// The bridge shut down before the record was acknowledged.
    ShutdownDeadline,
}

impl PublishError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl DeadLetterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl FailureReason {
    /// A short, stable label. Used as a header value and metric attribute.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Permanent { .. } => "permanent",
            Self::ShutdownDeadline => "shutdown_deadline",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "retries exhausted after {attempts} attempts: {last_error}"),
            Self::Permanent { error } => write!(f, "rejected: {error}"),
            Self::ShutdownDeadline => write!(f, "not acknowledged before shutdown deadline"),
        }
    }
}

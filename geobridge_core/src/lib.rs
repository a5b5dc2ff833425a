//! Bridge between device connections and a message broker.
//!
//! Devices push coordinate records over long-lived connections. Each
//! connection is served by a session that decodes records and feeds them to a
//! bounded publish queue. A single publisher drains the queue in batches,
//! publishes to the broker with retries and routes records it cannot deliver
//! to a dead-letter sink.
pub mod broker;
pub mod connection;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod options;
pub mod publisher;
pub mod queue;
pub mod record;
pub mod session;
pub mod supervisor;

pub use broker::{Ack, BrokerClient, DeadLetterError, DeadLetterSink, FailureReason, PublishError};
pub use connection::{ConnectionError, SourceConnection};
pub use error::{BridgeError, Result};
pub use metrics::{BatchOutcome, StatsSnapshot};
pub use options::{BackpressurePolicy, BridgeOptions, PublisherOptions, QueueOptions, RetryOptions};
pub use publisher::PublisherReport;
pub use record::{CoordinateRecord, DecodeError, SourceId, decode, encode};
pub use session::{SessionExit, SessionId, SessionState};
pub use supervisor::{Bridge, BridgeHandle, SessionInfo, ShutdownReport};

//! In-memory implementations of the bridge collaborators.
//!
//! These are suitable for testing and development. The broker keeps every
//! acknowledged message in a log and supports failure injection, latency and
//! stalling; the dead-letter sink keeps every record it receives.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::{
    broker::{Ack, BrokerClient, DeadLetterError, DeadLetterSink, FailureReason, PublishError},
    connection::{ConnectionError, SourceConnection},
    record::{self, CoordinateRecord, SourceId},
};

/// A message acknowledged by the [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub payload: Bytes,
    pub ack: Ack,
}

#[derive(Debug, Default)]
struct BrokerLog {
    /// Acknowledged messages, in acknowledgment order.
    published: Vec<PublishedMessage>,
    /// Every publish call, including failed ones, in call order.
    attempts: Vec<Vec<u8>>,
    /// Errors to return, per key, before accepting messages again.
    failures: HashMap<Vec<u8>, VecDeque<PublishError>>,
    next_offset: HashMap<String, i64>,
}

/// In-memory broker with a single partition per topic.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    log: Mutex<BrokerLog>,
    latency: Option<Duration>,
    stalled: AtomicBool,
    in_flight: AtomicUsize,
}

/// In-memory dead-letter sink.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<(CoordinateRecord, FailureReason)>>,
    latency: Option<Duration>,
    failing: AtomicBool,
}

/// The session side of an in-memory connection.
#[derive(Debug)]
pub struct ChannelConnection {
    rx: mpsc::UnboundedReceiver<Result<Bytes, ConnectionError>>,
    peer: String,
    closed: Arc<AtomicBool>,
}

/// The device side of an in-memory connection.
///
/// Dropping it closes the connection, as a device disconnecting would.
#[derive(Debug, Clone)]
pub struct ChannelConnectionSender {
    tx: mpsc::UnboundedSender<Result<Bytes, ConnectionError>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every publish by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next publishes of `source_id` fail with `errors`, in order.
    pub async fn fail_next(
        &self,
        source_id: SourceId,
        errors: impl IntoIterator<Item = PublishError>,
    ) {
        let key = source_id.to_string().into_bytes();
        let mut log = self.log.lock().await;
        log.failures.entry(key).or_default().extend(errors);
    }

    /// While stalled, publishes never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.log.lock().await.published.clone()
    }

    /// The acknowledged records, in acknowledgment order.
    pub async fn records(&self) -> Vec<CoordinateRecord> {
        self.log
            .lock()
            .await
            .published
            .iter()
            .filter_map(|message| record::decode(&message.payload).ok())
            .collect()
    }

    /// The key of every publish call, including failed ones.
    pub async fn attempts(&self) -> Vec<Vec<u8>> {
        self.log.lock().await.attempts.clone()
    }

    async fn append(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<Ack, PublishError> {
        let mut log = self.log.lock().await;
        log.attempts.push(key.to_vec());

        if let Some(error) = log.failures.get_mut(key).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        let offset = log.next_offset.entry(topic.to_string()).or_default();
        let ack = Ack {
            partition: 0,
            offset: *offset,
        };
        *offset += 1;

        log.published.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_vec(),
            payload,
            ack,
        });

        Ok(ack)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &[u8], payload: Bytes) -> Result<Ack, PublishError> {
        let _guard = InFlightGuard::new(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.stalled.load(Ordering::SeqCst) {
            self.log.lock().await.attempts.push(key.to_vec());
            std::future::pending::<()>().await;
        }

        self.append(topic, key, payload).await
    }

    async fn flush(&self, _timeout: Duration) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every following call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<(CoordinateRecord, FailureReason)> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn dead_letter(
        &self,
        record: CoordinateRecord,
        reason: FailureReason,
    ) -> Result<(), DeadLetterError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(DeadLetterError::new("dead-letter sink unavailable"));
        }

        self.entries.lock().await.push((record, reason));
        Ok(())
    }
}

impl ChannelConnection {
    /// Creates a connected pair. `peer` shows up in the session snapshot.
    pub fn pair(peer: impl Into<String>) -> (ChannelConnectionSender, ChannelConnection) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let sender = ChannelConnectionSender {
            tx,
            closed: closed.clone(),
        };
        let conn = ChannelConnection {
            rx,
            peer: peer.into(),
            closed,
        };

        (sender, conn)
    }
}

#[async_trait]
impl SourceConnection for ChannelConnection {
    async fn recv(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

impl ChannelConnectionSender {
    /// Sends a raw message. Returns false if the session is gone.
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        self.tx.send(Ok(data.into())).is_ok()
    }

    /// Sends a record in the device wire format.
    pub fn send_record(&self, record: &CoordinateRecord) -> bool {
        self.send(record::encode(record))
    }

    /// Makes the next read fail.
    pub fn fail(&self, error: ConnectionError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    /// Whether the session closed its side of the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

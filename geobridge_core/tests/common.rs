#![allow(dead_code)]

use std::{sync::Arc, time::Duration, time::SystemTime};

use geobridge_core::{
    Bridge, BridgeHandle, BridgeOptions, CoordinateRecord, SourceId, StatsSnapshot,
    memory::{ChannelConnection, ChannelConnectionSender, InMemoryBroker, InMemoryDeadLetterSink},
};

pub struct TestBridge {
    pub bridge: Bridge,
    pub broker: Arc<InMemoryBroker>,
    pub dead_letter: Arc<InMemoryDeadLetterSink>,
}

pub fn start_bridge(options: BridgeOptions) -> TestBridge {
    start_bridge_with_broker(options, InMemoryBroker::new())
}

pub fn start_bridge_with_broker(options: BridgeOptions, broker: InMemoryBroker) -> TestBridge {
    start_bridge_with_clients(options, broker, InMemoryDeadLetterSink::new())
}

pub fn start_bridge_with_clients(
    options: BridgeOptions,
    broker: InMemoryBroker,
    dead_letter: InMemoryDeadLetterSink,
) -> TestBridge {
    let broker = Arc::new(broker);
    let dead_letter = Arc::new(dead_letter);
    let bridge = Bridge::start(options, broker.clone(), dead_letter.clone()).expect("bridge start");

    TestBridge {
        bridge,
        broker,
        dead_letter,
    }
}

pub async fn connect(handle: &BridgeHandle, peer: &str) -> ChannelConnectionSender {
    let (sender, conn) = ChannelConnection::pair(peer);
    handle.attach(conn).await.expect("attach");
    sender
}

/// A record whose latitude encodes its position in the stream of `source`.
pub fn record(source: i64, sequence: u64) -> CoordinateRecord {
    CoordinateRecord::new(
        SourceId(source),
        sequence as f64 / 100.0,
        -74.006,
        SystemTime::now(),
    )
    .expect("valid record")
}

pub fn sequence_of(record: &CoordinateRecord) -> u64 {
    (record.latitude() * 100.0).round() as u64
}

/// The sequences of `source`, in the order the broker acknowledged them.
pub async fn published_sequences(broker: &InMemoryBroker, source: i64) -> Vec<u64> {
    broker
        .records()
        .await
        .iter()
        .filter(|r| r.source_id() == SourceId(source))
        .map(sequence_of)
        .collect()
}

pub async fn wait_for_published(broker: &InMemoryBroker, count: usize) {
    tokio::time::timeout(wait_timeout(), async {
        while broker.published().await.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for published records");
}

pub async fn wait_for_stats(handle: &BridgeHandle, condition: impl Fn(&StatsSnapshot) -> bool) {
    tokio::time::timeout(wait_timeout(), async {
        while !condition(&handle.stats()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for stats");
}

pub async fn wait_for_sessions(handle: &BridgeHandle, count: usize) {
    tokio::time::timeout(wait_timeout(), async {
        while handle.sessions().len() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for sessions");
}

/// Every record read was either enqueued, dropped or rejected by the decoder.
pub fn assert_received_accounted(stats: &StatsSnapshot) {
    assert_eq!(
        stats.records_received,
        stats.records_enqueued + stats.records_dropped + stats.decode_errors,
        "{stats:?}"
    );
}

/// Every enqueued record was acknowledged, dead-lettered or abandoned.
pub fn assert_enqueued_accounted(stats: &StatsSnapshot) {
    assert_eq!(
        stats.records_enqueued,
        stats.records_acknowledged
            + stats.records_dead_lettered
            + stats.dead_letter_failures
            + stats.records_abandoned,
        "{stats:?}"
    );
}

pub fn wait_timeout() -> Duration {
    Duration::from_secs(30)
}

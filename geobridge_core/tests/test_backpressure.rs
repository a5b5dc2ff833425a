use std::time::Duration;

use common::{
    assert_received_accounted, connect, record, start_bridge, wait_for_sessions, wait_for_stats,
};
use geobridge_core::{
    BackpressurePolicy, BridgeOptions, FailureReason, SessionState, memory::ChannelConnection,
};
use tokio::time::Instant;

mod common;

fn saturated_options(policy: BackpressurePolicy) -> BridgeOptions {
    BridgeOptions::default()
        .with_queue_capacity(1)
        .with_batching(1, Duration::from_millis(10))
        .with_enqueue_timeout(Duration::from_millis(100))
        .with_backpressure(policy)
}

#[tokio::test(start_paused = true)]
async fn test_fail_open_drops_and_keeps_session() {
    let test = start_bridge(saturated_options(BackpressurePolicy::FailOpen));
    let handle = test.bridge.handle();
    test.broker.set_stalled(true);

    let sender = connect(&handle, "device").await;

    // The publisher holds the first record, the queue holds the second.
    assert!(sender.send_record(&record(1, 0)));
    wait_for_stats(&handle, |s| s.records_enqueued == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sender.send_record(&record(1, 1)));
    wait_for_stats(&handle, |s| s.records_enqueued == 2).await;

    assert!(sender.send_record(&record(1, 2)));
    wait_for_stats(&handle, |s| s.records_dropped == 1).await;

    let sessions = handle.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Active);
    assert!(!sender.is_closed());

    // The session keeps reading after a drop.
    assert!(sender.send_record(&record(1, 3)));
    wait_for_stats(&handle, |s| s.records_received == 4).await;

    let report = test.bridge.shutdown(Duration::from_secs(2)).await;
    assert!(report.elapsed <= Duration::from_secs(2));

    let entries = test.dead_letter.entries().await;
    assert!(
        entries
            .iter()
            .all(|(_, reason)| reason == &FailureReason::ShutdownDeadline)
    );
    assert!(test.broker.published().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fail_closed_closes_session() {
    let test = start_bridge(saturated_options(BackpressurePolicy::FailClosed));
    let handle = test.bridge.handle();
    test.broker.set_stalled(true);

    let sender = connect(&handle, "device").await;

    assert!(sender.send_record(&record(1, 0)));
    wait_for_stats(&handle, |s| s.records_enqueued == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sender.send_record(&record(1, 1)));
    wait_for_stats(&handle, |s| s.records_enqueued == 2).await;

    assert!(sender.send_record(&record(1, 2)));
    wait_for_sessions(&handle, 0).await;

    let stats = handle.stats();
    assert_eq!(stats.sessions_closed_by_backpressure, 1);
    assert_eq!(stats.records_dropped, 1);
    assert_received_accounted(&stats);
    assert!(sender.is_closed());

    test.bridge.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(start_paused = true)]
async fn test_close_session_interrupts_pending_enqueue() {
    let options = saturated_options(BackpressurePolicy::FailOpen)
        .with_enqueue_timeout(Duration::from_secs(10));
    let test = start_bridge(options);
    let handle = test.bridge.handle();
    test.broker.set_stalled(true);

    let (sender, conn) = ChannelConnection::pair("device");
    let id = handle.attach(conn).await.expect("attach");

    assert!(sender.send_record(&record(1, 0)));
    wait_for_stats(&handle, |s| s.records_enqueued == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sender.send_record(&record(1, 1)));
    wait_for_stats(&handle, |s| s.records_enqueued == 2).await;

    // Blocks on the full queue for up to ten seconds.
    assert!(sender.send_record(&record(1, 2)));
    wait_for_stats(&handle, |s| s.records_received == 3).await;

    let closed_at = Instant::now();
    assert!(handle.close_session(id).await.expect("close"));
    wait_for_sessions(&handle, 0).await;
    assert!(closed_at.elapsed() < Duration::from_secs(1));

    let stats = handle.stats();
    assert_eq!(stats.records_enqueued, 2);
    assert_eq!(stats.records_dropped, 1);
    assert_received_accounted(&stats);

    test.bridge.shutdown(Duration::from_secs(2)).await;
}

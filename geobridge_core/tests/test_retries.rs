use std::time::Duration;

use common::{
    connect, published_sequences, record, sequence_of, start_bridge, wait_for_published,
    wait_for_stats,
};
use geobridge_core::{BridgeOptions, FailureReason, PublishError, RetryOptions, SourceId};

mod common;

fn retry_options(max_retries: u32) -> RetryOptions {
    RetryOptions {
        max_retries,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_then_success() {
    let options = BridgeOptions::default().with_retry(retry_options(5));
    let test = start_bridge(options);
    let handle = test.bridge.handle();

    test.broker
        .fail_next(
            SourceId(1),
            [
                PublishError::transient("leader not available"),
                PublishError::transient("leader not available"),
            ],
        )
        .await;

    let sender = connect(&handle, "device").await;
    for sequence in 0..3 {
        assert!(sender.send_record(&record(1, sequence)));
    }

    wait_for_published(&test.broker, 3).await;

    // The first record is acknowledged once, and the records after it wait.
    assert_eq!(published_sequences(&test.broker, 1).await, vec![0, 1, 2]);
    assert_eq!(test.broker.attempts().await.len(), 5);
    assert!(test.dead_letter.entries().await.is_empty());

    let stats = handle.stats();
    assert_eq!(stats.publish_retries, 2);
    assert_eq!(stats.records_acknowledged, 3);
    assert_eq!(stats.records_dead_lettered, 0);

    test.bridge.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_goes_to_dead_letter_once() {
    let options = BridgeOptions::default().with_retry(retry_options(2));
    let test = start_bridge(options);
    let handle = test.bridge.handle();

    test.broker
        .fail_next(
            SourceId(7),
            (0..10).map(|_| PublishError::transient("request timed out")),
        )
        .await;

    let failing = connect(&handle, "failing").await;
    let healthy = connect(&handle, "healthy").await;
    assert!(failing.send_record(&record(7, 0)));
    assert!(healthy.send_record(&record(8, 0)));

    wait_for_stats(&handle, |s| s.records_dead_lettered == 1).await;
    wait_for_published(&test.broker, 1).await;

    let entries = test.dead_letter.entries().await;
    assert_eq!(entries.len(), 1);
    let (dead, reason) = &entries[0];
    assert_eq!(dead.source_id(), SourceId(7));
    assert_eq!(sequence_of(dead), 0);
    assert_eq!(
        reason,
        &FailureReason::RetriesExhausted {
            attempts: 3,
            last_error: PublishError::transient("request timed out"),
        }
    );

    // Give the publisher time to misbehave.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let attempts = test.broker.attempts().await;
    assert_eq!(attempts.iter().filter(|key| key.as_slice() == b"7").count(), 3);
    assert!(published_sequences(&test.broker, 7).await.is_empty());
    assert_eq!(published_sequences(&test.broker, 8).await, vec![0]);
    assert_eq!(test.dead_letter.entries().await.len(), 1);

    test.bridge.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let test = start_bridge(BridgeOptions::default().with_retry(retry_options(5)));
    let handle = test.bridge.handle();

    test.broker
        .fail_next(SourceId(3), [PublishError::permanent("message too large")])
        .await;

    let sender = connect(&handle, "device").await;
    assert!(sender.send_record(&record(3, 0)));
    assert!(sender.send_record(&record(3, 1)));

    wait_for_published(&test.broker, 1).await;

    assert_eq!(published_sequences(&test.broker, 3).await, vec![1]);
    assert_eq!(test.broker.attempts().await.len(), 2);

    let entries = test.dead_letter.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(sequence_of(&entries[0].0), 0);
    assert!(matches!(entries[0].1, FailureReason::Permanent { .. }));
    assert_eq!(handle.stats().publish_retries, 0);

    test.bridge.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_failure_is_not_fatal() {
    let test = start_bridge(BridgeOptions::default().with_retry(retry_options(0)));
    let handle = test.bridge.handle();

    test.dead_letter.set_failing(true);
    test.broker
        .fail_next(SourceId(5), [PublishError::transient("broker down")])
        .await;

    let sender = connect(&handle, "device").await;
    assert!(sender.send_record(&record(5, 0)));
    assert!(sender.send_record(&record(5, 1)));

    wait_for_published(&test.broker, 1).await;

    let stats = handle.stats();
    assert_eq!(stats.dead_letter_failures, 1);
    assert_eq!(stats.records_dead_lettered, 0);
    assert_eq!(published_sequences(&test.broker, 5).await, vec![1]);

    test.bridge.shutdown(Duration::from_secs(1)).await;
}

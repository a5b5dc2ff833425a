//! Bounded FIFO between the sessions and the publisher.
//!
//! Many sessions hold a [`PublishQueueSender`]; exactly one publisher owns the
//! [`PublishQueueReceiver`]. Entries enqueued by one session are dequeued in
//! the order they were enqueued.
use std::time::Duration;

use snafu::Snafu;
use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    time::Instant,
};

use crate::{record::CoordinateRecord, session::SessionId};

/// A record waiting to be published.
#[derive(Debug, Clone)]
pub struct PublishQueueEntry {
    pub record: CoordinateRecord,
    /// Position of the record in the session that produced it.
    pub sequence: u64,
    pub session_id: SessionId,
    pub enqueued_at: Instant,
    /// Number of failed publish attempts so far.
    pub retry_count: u32,
}

#[derive(Debug, Snafu)]
pub enum EnqueueError {
    /// The queue stayed full for the whole timeout.
    #[snafu(display("publish queue is full"))]
    QueueFull { entry: PublishQueueEntry },
    /// The publisher is gone.
    #[snafu(display("publish queue is closed"))]
    Closed { entry: PublishQueueEntry },
}

/// Every sender is gone and the queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

#[derive(Debug, Clone)]
pub struct PublishQueueSender {
    tx: mpsc::Sender<PublishQueueEntry>,
}

#[derive(Debug)]
pub struct PublishQueueReceiver {
    rx: mpsc::Receiver<PublishQueueEntry>,
    capacity: usize,
}

/// Creates a queue holding at most `capacity` entries.
///
/// Panics if `capacity` is zero. Options validation rejects it first.
pub fn publish_queue(capacity: usize) -> (PublishQueueSender, PublishQueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PublishQueueSender { tx },
        PublishQueueReceiver { rx, capacity },
    )
}

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publish queue is closed and drained")
    }
}

impl std::error::Error for QueueClosed {}

impl PublishQueueEntry {
    pub fn new(record: CoordinateRecord, sequence: u64, session_id: SessionId) -> Self {
        Self {
            record,
            sequence,
            session_id,
            enqueued_at: Instant::now(),
            retry_count: 0,
        }
    }
}

impl EnqueueError {
    pub fn into_entry(self) -> PublishQueueEntry {
        match self {
            Self::QueueFull { entry } | Self::Closed { entry } => entry,
        }
    }
}

impl PublishQueueSender {
    /// Appends an entry, waiting up to `timeout` for room.
    ///
    /// On failure the entry is handed back to the caller.
    pub async fn enqueue(
        &self,
        entry: PublishQueueEntry,
        timeout: Duration,
    ) -> Result<(), EnqueueError> {
        match self.tx.send_timeout(entry, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(entry)) => Err(EnqueueError::QueueFull { entry }),
            Err(SendTimeoutError::Closed(entry)) => Err(EnqueueError::Closed { entry }),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl PublishQueueReceiver {
    /// Takes between 1 and `max_size` entries.
    ///
    /// Waits up to `max_wait` for the first entry and returns an empty batch
    /// if none arrived. Once every sender is dropped and the queue is
    /// drained, returns [`QueueClosed`]. A `max_size` of 0 returns an empty
    /// batch right away, without taking anything.
    pub async fn dequeue_batch(
        &mut self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<PublishQueueEntry>, QueueClosed> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let first = match tokio::time::timeout(max_wait, self.rx.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => return Err(QueueClosed),
            Ok(Some(entry)) => entry,
        };

        let mut batch = Vec::with_capacity(max_size.min(self.capacity));
        batch.push(first);

        while batch.len() < max_size {
            let Ok(entry) = self.rx.try_recv() else {
                break;
            };
            batch.push(entry);
        }

        Ok(batch)
    }

    /// Closes the queue to new entries and returns everything still buffered.
    pub fn close_and_drain(&mut self) -> Vec<PublishQueueEntry> {
        self.rx.close();

        let mut remaining = Vec::new();
        while let Ok(entry) = self.rx.try_recv() {
            remaining.push(entry);
        }

        remaining
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::record::SourceId;

    fn entry(source: i64, sequence: u64) -> PublishQueueEntry {
        let record = CoordinateRecord::new(SourceId(source), 1.0, 2.0, SystemTime::now()).unwrap();
        PublishQueueEntry::new(record, sequence, SessionId(source as u64))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_preserves_order_and_respects_max_size() {
        let (tx, mut rx) = publish_queue(8);

        for i in 0..5 {
            tx.enqueue(entry(1, i), Duration::ZERO).await.unwrap();
        }
        assert_eq!(tx.len(), 5);

        let batch = rx.dequeue_batch(3, Duration::from_millis(10)).await.unwrap();
        let sequences = batch.iter().map(|e| e.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![0, 1, 2]);

        let batch = rx.dequeue_batch(3, Duration::from_millis(10)).await.unwrap();
        let sequences = batch.iter().map(|e| e.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_with_empty_batch() {
        let (_tx, mut rx) = publish_queue(2);
        let batch = rx.dequeue_batch(10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_zero_takes_nothing() {
        let (tx, mut rx) = publish_queue(4);
        tx.enqueue(entry(1, 0), Duration::ZERO).await.unwrap();

        let batch = rx.dequeue_batch(0, Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(tx.len(), 1);

        let batch = rx.dequeue_batch(1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_full_returns_entry() {
        let (tx, _rx) = publish_queue(1);
        tx.enqueue(entry(1, 0), Duration::ZERO).await.unwrap();

        let err = tx
            .enqueue(entry(1, 1), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::QueueFull { .. }));
        assert_eq!(err.into_entry().sequence, 1);
    }

    #[tokio::test]
    async fn test_closed_after_senders_drop_and_drain() {
        let (tx, mut rx) = publish_queue(4);
        tx.enqueue(entry(1, 0), Duration::ZERO).await.unwrap();
        drop(tx);

        let batch = rx.dequeue_batch(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(rx.dequeue_batch(10, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_after_receiver_close() {
        let (tx, mut rx) = publish_queue(4);
        tx.enqueue(entry(1, 0), Duration::ZERO).await.unwrap();

        let remaining = rx.close_and_drain();
        assert_eq!(remaining.len(), 1);

        let err = tx.enqueue(entry(1, 1), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Closed { .. }));
    }
}

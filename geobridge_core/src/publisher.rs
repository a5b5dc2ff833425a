//! The publisher drains the queue in batches and publishes them to the broker.
//!
//! Within a batch, records are grouped in one lane per source. Lanes are
//! published concurrently while the records of a lane are published one at a
//! time, each waiting for its acknowledgment, so that the broker receives the
//! records of a source in the order the source sent them. The next batch is
//! only dequeued once every record of the current batch is resolved, either
//! acknowledged or dead-lettered.
//!
//! When aborted, the publisher hands every unresolved record to the
//! dead-letter sink concurrently and gives up on the ones still pending
//! shortly before the hard deadline carried by the abort. Those are counted
//! as abandoned.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, OnceLock},
    time::Duration,
};

use futures::{
    StreamExt,
    future::join_all,
    stream::FuturesUnordered,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    broker::{Ack, BrokerClient, DeadLetterSink, FailureReason},
    metrics::{BatchOutcome, BridgeStats},
    options::PublisherOptions,
    queue::{PublishQueueEntry, PublishQueueReceiver, QueueClosed},
    record::{self, SourceId},
};

/// How long the publisher waits for a record before checking for an abort
/// again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Time left to the publisher to report between giving up on pending
/// dead-letters and the hard deadline.
const ABANDON_MARGIN: Duration = Duration::from_millis(20);

pub struct Publisher {
    queue: PublishQueueReceiver,
    broker: Arc<dyn BrokerClient>,
    dead_letter: Arc<dyn DeadLetterSink>,
    options: PublisherOptions,
    flush_timeout: Duration,
    stats: Arc<BridgeStats>,
}

/// Summary returned when the publisher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherReport {
    /// Whether the publisher was stopped by the abort signal rather than by
    /// the queue closing.
    pub aborted: bool,
    /// Records handed to the dead-letter sink because of the abort.
    pub dead_lettered_on_abort: u64,
    /// Records still unresolved when the abort deadline was reached.
    pub abandoned: u64,
    /// Messages the broker still had in flight after the final flush, if the
    /// flush returned in time.
    pub unflushed: Option<usize>,
}

/// Tells the publisher to stop, and by when it must have returned.
#[derive(Debug, Clone, Default)]
pub struct PublisherAbort {
    token: CancellationToken,
    deadline: Arc<OnceLock<Instant>>,
}

type Lane = VecDeque<PublishQueueEntry>;

enum Resolution {
    Acknowledged(Ack),
    Failed(FailureReason),
    Aborted,
}

impl PublisherAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the publisher. Only the first deadline is kept.
    pub fn abort(&self, deadline: Instant) {
        let _ = self.deadline.set(deadline);
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Resolves once aborted and the deadline, minus a small margin, is
    /// reached.
    async fn deadline_reached(&self) {
        self.token.cancelled().await;

        let Some(deadline) = self.deadline.get().copied() else {
            return;
        };
        let give_up_at = deadline.checked_sub(ABANDON_MARGIN).unwrap_or(deadline);
        tokio::time::sleep_until(give_up_at).await;
    }
}

impl Publisher {
    pub fn new(
        queue: PublishQueueReceiver,
        broker: Arc<dyn BrokerClient>,
        dead_letter: Arc<dyn DeadLetterSink>,
        options: PublisherOptions,
        shutdown_grace: Duration,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            queue,
            broker,
            dead_letter,
            options,
            flush_timeout: shutdown_grace / 2,
            stats,
        }
    }

    /// Publishes until the queue is closed and drained, or until aborted.
    ///
    /// On abort, the broker is flushed while every record not yet resolved,
    /// including the ones still queued, goes to the dead-letter sink. Both
    /// are cut short by the abort deadline.
    pub async fn run(mut self, abort: PublisherAbort) -> PublisherReport {
        info!(topic = %self.options.topic, "publisher started");

        loop {
            let mut batch = Vec::with_capacity(self.options.max_batch_size);

            let collected = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                collected = self.collect_batch(&mut batch) => Some(collected),
            };

            match collected {
                None => return self.abort(vec![batch.into()], &abort).await,
                Some(Err(QueueClosed)) if batch.is_empty() => break,
                Some(_) if batch.is_empty() => continue,
                Some(_) => {}
            }

            let mut lanes = into_lanes(batch);
            let outcome = self.publish_lanes(&mut lanes, &abort).await;
            self.stats.record_batch(&outcome);

            debug!(
                acknowledged = outcome.acknowledged,
                retried = outcome.retried,
                dead_lettered = outcome.dead_lettered,
                abandoned = outcome.abandoned,
                "batch published"
            );

            if abort.is_aborted() {
                return self.abort(lanes, &abort).await;
            }
        }

        info!("publish queue closed, publisher stopped");

        PublisherReport::default()
    }

    /// Appends records to `batch` until the size limit or the linger time is
    /// reached.
    ///
    /// Entries are moved into `batch` as soon as they are dequeued, so that
    /// dropping this future does not lose them.
    async fn collect_batch(
        &mut self,
        batch: &mut Vec<PublishQueueEntry>,
    ) -> Result<(), QueueClosed> {
        let max_size = self.options.max_batch_size;

        batch.extend(self.queue.dequeue_batch(max_size, IDLE_POLL_INTERVAL).await?);
        if batch.is_empty() {
            return Ok(());
        }

        let linger_deadline = Instant::now() + self.options.max_batch_linger;
        while batch.len() < max_size {
            let now = Instant::now();
            if now >= linger_deadline {
                break;
            }

            let more = self
                .queue
                .dequeue_batch(max_size - batch.len(), linger_deadline - now)
                .await?;
            if more.is_empty() {
                break;
            }

            batch.extend(more);
        }

        Ok(())
    }

    async fn publish_lanes(&self, lanes: &mut [Lane], abort: &PublisherAbort) -> BatchOutcome {
        let outcomes = join_all(
            lanes
                .iter_mut()
                .map(|lane| self.publish_lane(lane, abort)),
        )
        .await;

        let mut total = BatchOutcome::default();
        for outcome in outcomes {
            total.merge(outcome);
        }

        total
    }

    /// Publishes the records of one source in order.
    ///
    /// A record is removed from the lane only once resolved: after an abort
    /// the lane holds exactly the unresolved records.
    async fn publish_lane(&self, lane: &mut Lane, abort: &PublisherAbort) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        while let Some(entry) = lane.front_mut() {
            let resolution = self.publish_entry(entry, abort, &mut outcome).await;
            if let Resolution::Aborted = resolution {
                break;
            }

            let Some(entry) = lane.pop_front() else {
                break;
            };

            match resolution {
                Resolution::Acknowledged(ack) => {
                    outcome.acknowledged += 1;
                    self.stats.record_acknowledged();
                    trace!(
                        source_id = %entry.record.source_id(),
                        sequence = entry.sequence,
                        partition = ack.partition,
                        offset = ack.offset,
                        "record acknowledged"
                    );
                }
                Resolution::Failed(reason) => {
                    if self.dead_letter(entry, reason, abort).await {
                        outcome.dead_lettered += 1;
                    } else {
                        outcome.abandoned += 1;
                    }
                }
                Resolution::Aborted => {}
            }
        }

        outcome
    }

    async fn publish_entry(
        &self,
        entry: &mut PublishQueueEntry,
        abort: &PublisherAbort,
        outcome: &mut BatchOutcome,
    ) -> Resolution {
        let key = entry.record.key();
        let payload = record::encode(&entry.record);
        let retry = &self.options.retry;

        loop {
            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => return Resolution::Aborted,
                result = self.broker.publish(&self.options.topic, &key, payload.clone()) => result,
            };

            let error = match result {
                Ok(ack) => return Resolution::Acknowledged(ack),
                Err(error) if !error.is_transient() => {
                    return Resolution::Failed(FailureReason::Permanent { error });
                }
                Err(error) => error,
            };

            if entry.retry_count >= retry.max_retries {
                return Resolution::Failed(FailureReason::RetriesExhausted {
                    attempts: entry.retry_count + 1,
                    last_error: error,
                });
            }

            entry.retry_count += 1;
            outcome.retried += 1;

            let delay = retry.backoff(entry.retry_count);
            debug!(
                source_id = %entry.record.source_id(),
                sequence = entry.sequence,
                retry = entry.retry_count,
                delay_ms = delay.as_millis() as u64,
                err = %error,
                "publish failed, retrying"
            );

            tokio::select! {
                biased;
                _ = abort.cancelled() => return Resolution::Aborted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Hands `entry` to the dead-letter sink, giving up at the abort
    /// deadline.
    ///
    /// Returns false if the record was abandoned.
    async fn dead_letter(
        &self,
        entry: PublishQueueEntry,
        reason: FailureReason,
        abort: &PublisherAbort,
    ) -> bool {
        let label = reason.label();
        let source_id = entry.record.source_id();
        let PublishQueueEntry {
            record,
            sequence,
            session_id,
            ..
        } = entry;

        let result = tokio::select! {
            biased;
            result = self.dead_letter.dead_letter(record, reason.clone()) => result,
            _ = abort.deadline_reached() => {
                self.stats.record_abandoned(1);
                error!(
                    %source_id,
                    sequence,
                    %session_id,
                    reason = %reason,
                    "record abandoned at the shutdown deadline"
                );
                return false;
            }
        };

        match result {
            Ok(()) => {
                self.stats.record_dead_lettered(label);
                warn!(
                    %source_id,
                    sequence,
                    %session_id,
                    reason = %reason,
                    "record dead-lettered"
                );
            }
            Err(err) => {
                self.stats.record_dead_letter_failure();
                error!(
                    %source_id,
                    sequence,
                    reason = %reason,
                    err = %err,
                    "failed to dead-letter record"
                );
            }
        }

        true
    }

    async fn abort(mut self, lanes: Vec<Lane>, abort: &PublisherAbort) -> PublisherReport {
        let mut unresolved = lanes.into_iter().flatten().collect::<Vec<_>>();
        unresolved.extend(self.queue.close_and_drain());

        warn!(
            unresolved = unresolved.len(),
            "publisher aborted, flushing broker and dead-lettering unresolved records"
        );

        let flush = async {
            tokio::select! {
                biased;
                unflushed = tokio::time::timeout(
                    self.flush_timeout,
                    self.broker.flush(self.flush_timeout),
                ) => unflushed.ok(),
                _ = abort.deadline_reached() => None,
            }
        };

        let dead_letters = async {
            let mut pending = unresolved
                .into_iter()
                .map(|entry| self.dead_letter(entry, FailureReason::ShutdownDeadline, abort))
                .collect::<FuturesUnordered<_>>();

            let (mut resolved, mut abandoned) = (0, 0);
            while let Some(delivered) = pending.next().await {
                if delivered {
                    resolved += 1;
                } else {
                    abandoned += 1;
                }
            }

            (resolved, abandoned)
        };

        let (unflushed, (dead_lettered_on_abort, abandoned)) = tokio::join!(flush, dead_letters);

        match unflushed {
            None => warn!("broker flush timed out"),
            Some(0) => {}
            Some(in_flight) => warn!(in_flight, "broker flush left messages in flight"),
        }

        if abandoned > 0 {
            error!(
                dead_lettered = dead_lettered_on_abort,
                abandoned, "records left unresolved at the shutdown deadline"
            );
        } else {
            warn!(
                dead_lettered = dead_lettered_on_abort,
                "unresolved records dead-lettered on abort"
            );
        }

        PublisherReport {
            aborted: true,
            dead_lettered_on_abort,
            abandoned,
            unflushed,
        }
    }
}

/// Splits a batch in one lane per source, keeping the order of each source.
fn into_lanes(batch: Vec<PublishQueueEntry>) -> Vec<Lane> {
    let mut index = HashMap::<SourceId, usize>::new();
    let mut lanes = Vec::<Lane>::new();

    for entry in batch {
        let source_id = entry.record.source_id();
        let lane = *index.entry(source_id).or_insert_with(|| {
            lanes.push(Lane::new());
            lanes.len() - 1
        });
        lanes[lane].push_back(entry);
    }

    lanes
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::{record::CoordinateRecord, session::SessionId};

    fn entry(source: i64, sequence: u64) -> PublishQueueEntry {
        let record = CoordinateRecord::new(SourceId(source), 0.0, 0.0, SystemTime::now()).unwrap();
        PublishQueueEntry::new(record, sequence, SessionId(source as u64))
    }

    #[test]
    fn test_into_lanes_groups_by_source_in_order() {
        let batch = vec![entry(1, 0), entry(2, 0), entry(1, 1), entry(3, 0), entry(2, 1)];
        let lanes = into_lanes(batch);

        let summary = lanes
            .iter()
            .map(|lane| {
                lane.iter()
                    .map(|e| (e.record.source_id().0, e.sequence))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        assert_eq!(
            summary,
            vec![
                vec![(1, 0), (1, 1)],
                vec![(2, 0), (2, 1)],
                vec![(3, 0)],
            ]
        );
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use geobridge_observability::{Counter, KeyValue};

/// Counters shared by the sessions and the publisher.
///
/// Every increment is recorded twice: in a plain atomic, readable through
/// [`BridgeStats::snapshot`], and in an OpenTelemetry counter.
pub struct BridgeStats {
    records_received: AtomicU64,
    decode_errors: AtomicU64,
    records_enqueued: AtomicU64,
    records_dropped: AtomicU64,
    sessions_closed_by_backpressure: AtomicU64,
    batches_published: AtomicU64,
    records_acknowledged: AtomicU64,
    publish_retries: AtomicU64,
    records_dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    records_abandoned: AtomicU64,
    metrics: BridgeMetrics,
}

/// A point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub records_received: u64,
    pub decode_errors: u64,
    pub records_enqueued: u64,
    pub records_dropped: u64,
    pub sessions_closed_by_backpressure: u64,
    pub batches_published: u64,
    pub records_acknowledged: u64,
    pub publish_retries: u64,
    pub records_dead_lettered: u64,
    pub dead_letter_failures: u64,
    /// Records neither acknowledged nor handed to the dead-letter sink by
    /// the shutdown deadline.
    pub records_abandoned: u64,
}

struct BridgeMetrics {
    received: Counter<u64>,
    decode_errors: Counter<u64>,
    enqueued: Counter<u64>,
    dropped: Counter<u64>,
    backpressure_closes: Counter<u64>,
    batches: Counter<u64>,
    acknowledged: Counter<u64>,
    retries: Counter<u64>,
    dead_lettered: Counter<u64>,
    dead_letter_failures: Counter<u64>,
    abandoned: Counter<u64>,
}

impl BridgeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            records_enqueued: self.records_enqueued.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            sessions_closed_by_backpressure: self
                .sessions_closed_by_backpressure
                .load(Ordering::Relaxed),
            batches_published: self.batches_published.load(Ordering::Relaxed),
            records_acknowledged: self.records_acknowledged.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            records_dead_lettered: self.records_dead_lettered.load(Ordering::Relaxed),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::Relaxed),
            records_abandoned: self.records_abandoned.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
        self.metrics.received.add(1, &[]);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.metrics.decode_errors.add(1, &[]);
    }

    pub(crate) fn record_enqueued(&self) {
        self.records_enqueued.fetch_add(1, Ordering::Relaxed);
        self.metrics.enqueued.add(1, &[]);
    }

    pub(crate) fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.dropped.add(1, &[]);
    }

    pub(crate) fn record_backpressure_close(&self) {
        self.sessions_closed_by_backpressure
            .fetch_add(1, Ordering::Relaxed);
        self.metrics.backpressure_closes.add(1, &[]);
    }

    pub(crate) fn record_acknowledged(&self) {
        self.records_acknowledged.fetch_add(1, Ordering::Relaxed);
        self.metrics.acknowledged.add(1, &[]);
    }

    /// Acknowledgments are counted per record, see
    /// [`BridgeStats::record_acknowledged`].
    pub(crate) fn record_batch(&self, outcome: &BatchOutcome) {
        self.batches_published.fetch_add(1, Ordering::Relaxed);
        self.metrics.batches.add(1, &[]);

        self.publish_retries
            .fetch_add(outcome.retried, Ordering::Relaxed);
        self.metrics.retries.add(outcome.retried, &[]);
    }

    pub(crate) fn record_dead_lettered(&self, reason: &'static str) {
        self.records_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .dead_lettered
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub(crate) fn record_dead_letter_failure(&self) {
        self.dead_letter_failures.fetch_add(1, Ordering::Relaxed);
        self.metrics.dead_letter_failures.add(1, &[]);
    }

    /// Enqueued records not yet acknowledged, dead-lettered or abandoned.
    pub(crate) fn unresolved(&self) -> u64 {
        let resolved = self.records_acknowledged.load(Ordering::Relaxed)
            + self.records_dead_lettered.load(Ordering::Relaxed)
            + self.dead_letter_failures.load(Ordering::Relaxed)
            + self.records_abandoned.load(Ordering::Relaxed);

        self.records_enqueued
            .load(Ordering::Relaxed)
            .saturating_sub(resolved)
    }

    pub(crate) fn record_abandoned(&self, count: u64) {
        if count == 0 {
            return;
        }

        self.records_abandoned.fetch_add(count, Ordering::Relaxed);
        self.metrics.abandoned.add(count, &[]);
    }
}

/// Result of publishing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub acknowledged: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Records whose dead-lettering was cut short by the shutdown deadline.
    pub abandoned: u64,
}

impl BatchOutcome {
    pub(crate) fn merge(&mut self, other: BatchOutcome) {
        self.acknowledged += other.acknowledged;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.abandoned += other.abandoned;
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self {
            records_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            records_enqueued: AtomicU64::new(0),
            records_dropped: AtomicU64::new(0),
            sessions_closed_by_backpressure: AtomicU64::new(0),
            batches_published: AtomicU64::new(0),
            records_acknowledged: AtomicU64::new(0),
            publish_retries: AtomicU64::new(0),
            records_dead_lettered: AtomicU64::new(0),
            dead_letter_failures: AtomicU64::new(0),
            records_abandoned: AtomicU64::new(0),
            metrics: BridgeMetrics::default(),
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        let meter = geobridge_observability::meter("bridge");
        Self {
            received: meter
                .u64_counter("bridge.session.records_received")
                .with_unit("{record}")
                .with_description("number of messages read from device connections")
                .build(),
            decode_errors: meter
                .u64_counter("bridge.session.decode_errors")
                .with_unit("{record}")
                .with_description("number of messages that failed to decode")
                .build(),
            enqueued: meter
                .u64_counter("bridge.queue.enqueued")
                .with_unit("{record}")
                .with_description("number of records added to the publish queue")
                .build(),
            dropped: meter
                .u64_counter("bridge.queue.dropped")
                .with_unit("{record}")
                .with_description("number of records dropped because the publish queue was full")
                .build(),
            backpressure_closes: meter
                .u64_counter("bridge.session.backpressure_closes")
                .with_unit("{session}")
                .with_description("number of sessions closed because the publish queue was full")
                .build(),
            batches: meter
                .u64_counter("bridge.publisher.batches")
                .with_unit("{batch}")
                .with_description("number of batches published")
                .build(),
            acknowledged: meter
                .u64_counter("bridge.publisher.acknowledged")
                .with_unit("{record}")
                .with_description("number of records acknowledged by the broker")
                .build(),
            retries: meter
                .u64_counter("bridge.publisher.retries")
                .with_unit("{attempt}")
                .with_description("number of publish retries")
                .build(),
            dead_lettered: meter
                .u64_counter("bridge.publisher.dead_lettered")
                .with_unit("{record}")
                .with_description("number of records sent to the dead-letter sink")
                .build(),
            dead_letter_failures: meter
                .u64_counter("bridge.publisher.dead_letter_failures")
                .with_unit("{record}")
                .with_description("number of records the dead-letter sink failed to accept")
                .build(),
            abandoned: meter
                .u64_counter("bridge.publisher.abandoned")
                .with_unit("{record}")
                .with_description("number of records left unresolved at the shutdown deadline")
                .build(),
        }
    }
}

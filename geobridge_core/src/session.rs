use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectionError, SourceConnection},
    metrics::BridgeStats,
    options::{BackpressurePolicy, QueueOptions},
    queue::{EnqueueError, PublishQueueEntry, PublishQueueSender},
    record::{self, CoordinateRecord},
};

/// Identifier assigned by the supervisor to each attached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached but not yet reading.
    Connecting,
    /// Reading and enqueueing records.
    Active,
    /// Shutdown started. No new reads.
    Draining,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone)]
pub enum SessionExit {
    /// The device closed the connection.
    PeerClosed,
    /// Reading from the connection failed.
    ConnectionFailed(ConnectionError),
    /// The queue was full and the policy is to close the session.
    Backpressure,
    /// The publisher is gone.
    QueueClosed,
    /// Coordinated shutdown.
    Drained,
    /// Closed by the supervisor, or by the shutdown hard deadline.
    Killed,
}

/// Reads records from one connection and feeds them to the publish queue.
pub(crate) struct Session {
    id: SessionId,
    conn: Box<dyn SourceConnection>,
    queue: PublishQueueSender,
    options: QueueOptions,
    stats: Arc<BridgeStats>,
    state: watch::Sender<SessionState>,
    drain: CancellationToken,
    kill: CancellationToken,
    next_sequence: u64,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        conn: Box<dyn SourceConnection>,
        queue: PublishQueueSender,
        options: QueueOptions,
        stats: Arc<BridgeStats>,
        drain: CancellationToken,
        kill: CancellationToken,
    ) -> (Self, watch::Receiver<SessionState>) {
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        let session = Self {
            id,
            conn,
            queue,
            options,
            stats,
            state,
            drain,
            kill,
            next_sequence: 0,
        };

        (session, state_rx)
    }

    pub(crate) async fn run(mut self) -> SessionExit {
        let peer = self.conn.peer();
        info!(session_id = %self.id, %peer, "session started");

        self.state.send_replace(SessionState::Active);
        let exit = self.read_loop().await;

        if !self.kill.is_cancelled() {
            tokio::select! {
                biased;
                _ = self.conn.close() => {}
                _ = self.kill.cancelled() => {}
            }
        }

        self.state.send_replace(SessionState::Closed);
        info!(
            session_id = %self.id,
            %peer,
            ?exit,
            records = self.next_sequence,
            "session closed"
        );

        exit
    }

    async fn read_loop(&mut self) -> SessionExit {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.kill.cancelled() => return SessionExit::Killed,
                _ = self.drain.cancelled() => {
                    self.state.send_replace(SessionState::Draining);
                    return SessionExit::Drained;
                }
                message = self.conn.recv() => message,
            };

            let data = match message {
                None => return SessionExit::PeerClosed,
                Some(Err(err)) => {
                    warn!(session_id = %self.id, err = %err, "connection failed");
                    return SessionExit::ConnectionFailed(err);
                }
                Some(Ok(data)) => data,
            };

            self.stats.record_received();

            let record = match record::decode(&data) {
                Ok(record) => record,
                Err(err) => {
                    self.stats.record_decode_error();
                    warn!(session_id = %self.id, err = %err, "failed to decode message");
                    continue;
                }
            };

            debug!(session_id = %self.id, %record, "record received");

            if let Some(exit) = self.enqueue(record).await {
                return exit;
            }
        }
    }

    /// Enqueues a record, applying the backpressure policy if the queue stays
    /// full.
    ///
    /// Every record that does not make it to the queue is counted as
    /// dropped. Returns the reason to end the session, if any.
    async fn enqueue(&mut self, record: CoordinateRecord) -> Option<SessionExit> {
        let source_id = record.source_id();
        let sequence = self.next_sequence;
        let entry = PublishQueueEntry::new(record, sequence, self.id);
        self.next_sequence += 1;

        let enqueue = self.queue.enqueue(entry, self.options.enqueue_timeout);
        tokio::pin!(enqueue);

        // A record already read is still enqueued once draining starts.
        let mut draining = false;
        let result = loop {
            tokio::select! {
                biased;
                _ = self.kill.cancelled() => {
                    self.stats.record_dropped();
                    warn!(
                        session_id = %self.id,
                        %source_id,
                        sequence,
                        "session killed while enqueueing, record dropped"
                    );
                    return Some(SessionExit::Killed);
                }
                _ = self.drain.cancelled(), if !draining => {
                    draining = true;
                    self.state.send_replace(SessionState::Draining);
                }
                result = &mut enqueue => break result,
            }
        };

        match result {
            Ok(()) => {
                self.stats.record_enqueued();
                None
            }
            Err(EnqueueError::Closed { .. }) => {
                self.stats.record_dropped();
                warn!(
                    session_id = %self.id,
                    %source_id,
                    sequence,
                    "publish queue closed, record dropped"
                );
                Some(SessionExit::QueueClosed)
            }
            Err(EnqueueError::QueueFull { .. }) => {
                self.stats.record_dropped();

                match self.options.backpressure {
                    BackpressurePolicy::FailOpen => {
                        warn!(
                            session_id = %self.id,
                            %source_id,
                            sequence,
                            "publish queue full, record dropped"
                        );
                        None
                    }
                    BackpressurePolicy::FailClosed => {
                        self.stats.record_backpressure_close();
                        warn!(
                            session_id = %self.id,
                            %source_id,
                            sequence,
                            "publish queue full, record dropped and session closing"
                        );
                        Some(SessionExit::Backpressure)
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Lifecycle of the bridge.
//!
//! [`Bridge::start`] spawns two background tasks: the publisher and the
//! supervisor. The supervisor task owns the session map, spawns one task per
//! attached connection and reaps them when they end. Other tasks talk to it
//! through a [`BridgeHandle`].
//!
//! Shutdown proceeds in order:
//!
//!  - new connections are rejected and every session stops reading,
//!  - sessions still running at `deadline - shutdown_grace` are killed,
//!  - the queue closes once the last session is gone,
//!  - the publisher drains the queue; if it is still running at
//!    `deadline - shutdown_grace` it is aborted and dead-letters whatever is
//!    left within the grace period. Records still unresolved at the deadline
//!    are counted as abandoned.
use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{self, JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    broker::{BrokerClient, DeadLetterSink},
    connection::SourceConnection,
    error::{BridgeError, Result, ShuttingDownSnafu, SupervisorGoneSnafu},
    metrics::{BridgeStats, StatsSnapshot},
    options::{BridgeOptions, QueueOptions},
    publisher::{Publisher, PublisherAbort, PublisherReport},
    queue::{PublishQueueSender, publish_queue},
    session::{Session, SessionExit, SessionId, SessionState},
};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// A running bridge.
///
/// Dropping it without calling [`Bridge::shutdown`] detaches its tasks. The
/// bridge keeps running until every [`BridgeHandle`] is dropped too. The
/// supervisor then stops and aborts the remaining sessions, and the publisher
/// drains the queue before exiting.
pub struct Bridge {
    handle: BridgeHandle,
    options: BridgeOptions,
    supervisor: JoinHandle<()>,
    publisher: JoinHandle<PublisherReport>,
    publisher_abort: PublisherAbort,
}

/// Cloneable handle used to attach and close sessions.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::Sender<SupervisorCommand>,
    sessions: watch::Receiver<Vec<SessionSlot>>,
    shutting_down: CancellationToken,
    stats: Arc<BridgeStats>,
}

/// Public view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: String,
    pub state: SessionState,
}

/// What happened during shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub elapsed: Duration,
    /// Sessions that ended on their own after being asked to drain.
    pub sessions_drained: usize,
    /// Sessions killed at the abort point.
    pub sessions_killed: usize,
    /// Whether every session task ended before the deadline.
    pub sessions_completed: bool,
    /// Outcome of the publisher, if it stopped before the deadline.
    pub publisher: Option<PublisherReport>,
    pub stats: StatsSnapshot,
}

struct WithReplyChannel<T, R> {
    data: T,
    reply: oneshot::Sender<R>,
}

enum SupervisorCommand {
    Attach(WithReplyChannel<Box<dyn SourceConnection>, Result<SessionId>>),
    Close(WithReplyChannel<SessionId, bool>),
    Shutdown(WithReplyChannel<Instant, SessionsShutdown>),
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionsShutdown {
    drained: usize,
    killed: usize,
}

#[derive(Clone)]
struct SessionSlot {
    id: SessionId,
    peer: String,
    state: watch::Receiver<SessionState>,
}

struct SessionEntry {
    slot: SessionSlot,
    kill: CancellationToken,
}

struct Supervisor {
    rx: mpsc::Receiver<SupervisorCommand>,
    queue: Option<PublishQueueSender>,
    options: QueueOptions,
    stats: Arc<BridgeStats>,
    sessions: HashMap<SessionId, SessionEntry>,
    task_ids: HashMap<task::Id, SessionId>,
    tasks: JoinSet<(SessionId, SessionExit)>,
    snapshot: watch::Sender<Vec<SessionSlot>>,
    next_id: u64,
    drain: CancellationToken,
    kill: CancellationToken,
}

impl Bridge {
    /// Validates the options and starts the publisher and supervisor tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        options: BridgeOptions,
        broker: Arc<dyn BrokerClient>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Result<Self> {
        options.validate()?;

        let stats = Arc::new(BridgeStats::default());
        let (queue_tx, queue_rx) = publish_queue(options.queue.capacity);

        let publisher_abort = PublisherAbort::new();
        let publisher = Publisher::new(
            queue_rx,
            broker,
            dead_letter,
            options.publisher.clone(),
            options.shutdown_grace,
            stats.clone(),
        );
        let publisher = tokio::spawn(publisher.run(publisher_abort.clone()));

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (snapshot, sessions) = watch::channel(Vec::new());
        let supervisor = Supervisor {
            rx,
            queue: Some(queue_tx),
            options: options.queue.clone(),
            stats: stats.clone(),
            sessions: HashMap::new(),
            task_ids: HashMap::new(),
            tasks: JoinSet::new(),
            snapshot,
            next_id: 0,
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
        };
        let supervisor = tokio::spawn(supervisor.run());

        info!(
            topic = %options.publisher.topic,
            queue_capacity = options.queue.capacity,
            backpressure = ?options.queue.backpressure,
            "bridge started"
        );

        Ok(Self {
            handle: BridgeHandle {
                tx,
                sessions,
                shutting_down: CancellationToken::new(),
                stats,
            },
            options,
            supervisor,
            publisher,
            publisher_abort,
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.handle.stats()
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Stops the bridge, returning before `deadline` elapses.
    ///
    /// Records that could not be published in time go to the dead-letter
    /// sink.
    pub async fn shutdown(self, deadline: Duration) -> ShutdownReport {
        let started = Instant::now();
        let hard_deadline = started + deadline;
        let grace = self.options.shutdown_grace.min(deadline);
        let abort_at = hard_deadline - grace;

        info!(
            deadline_ms = deadline.as_millis() as u64,
            grace_ms = grace.as_millis() as u64,
            "bridge shutting down"
        );

        self.handle.shutting_down.cancel();

        let Self {
            handle,
            supervisor,
            mut publisher,
            publisher_abort,
            ..
        } = self;

        // The command channel may be full of attach requests.
        let (reply, reply_rx) = oneshot::channel();
        let command = SupervisorCommand::Shutdown(WithReplyChannel {
            data: abort_at,
            reply,
        });
        let sessions = match tokio::time::timeout_at(hard_deadline, handle.tx.send(command)).await {
            Ok(Ok(())) => tokio::time::timeout_at(hard_deadline, reply_rx)
                .await
                .ok()
                .and_then(|reply| reply.ok()),
            Ok(Err(_)) | Err(_) => None,
        };

        if sessions.is_none() {
            warn!("sessions did not stop before the deadline");
            supervisor.abort();
        }

        let publisher_report =
            match tokio::time::timeout_at(abort_at.max(Instant::now()), &mut publisher).await {
                Ok(report) => report.map_err(log_join_error).ok(),
                Err(_) => {
                    warn!("publisher still running, aborting");
                    publisher_abort.abort(hard_deadline);

                    match tokio::time::timeout_at(hard_deadline, &mut publisher).await {
                        Ok(report) => report.map_err(log_join_error).ok(),
                        Err(_) => {
                            publisher.abort();
                            let lost = handle.stats.unresolved();
                            handle.stats.record_abandoned(lost);
                            error!(
                                abandoned = lost,
                                "publisher did not stop before the deadline"
                            );
                            None
                        }
                    }
                }
            };

        let sessions_completed = sessions.is_some();
        let sessions = sessions.unwrap_or_default();
        let report = ShutdownReport {
            elapsed: started.elapsed(),
            sessions_drained: sessions.drained,
            sessions_killed: sessions.killed,
            sessions_completed,
            publisher: publisher_report,
            stats: handle.stats(),
        };

        info!(
            elapsed_ms = report.elapsed.as_millis() as u64,
            sessions_drained = report.sessions_drained,
            sessions_killed = report.sessions_killed,
            dead_lettered = report.stats.records_dead_lettered,
            abandoned = report.stats.records_abandoned,
            "bridge stopped"
        );

        report
    }
}

impl BridgeHandle {
    /// Starts a session reading from `conn`.
    pub async fn attach(&self, conn: impl SourceConnection) -> Result<SessionId> {
        if self.shutting_down.is_cancelled() {
            return ShuttingDownSnafu.fail();
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Attach(WithReplyChannel {
                data: Box::new(conn),
                reply,
            }))
            .await
            .map_err(|_| self.closed_error())?;

        rx.await.map_err(|_| self.closed_error())?
    }

    /// Closes a session, interrupting any pending enqueue.
    ///
    /// Returns false if no such session is running.
    pub async fn close_session(&self, id: SessionId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Close(WithReplyChannel { data: id, reply }))
            .await
            .map_err(|_| self.closed_error())?;

        rx.await.map_err(|_| self.closed_error())
    }

    /// The sessions currently running, ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .borrow()
            .iter()
            .map(|slot| SessionInfo {
                id: slot.id,
                peer: slot.peer.clone(),
                state: *slot.state.borrow(),
            })
            .collect()
    }

    /// Waits until the session map changes.
    pub async fn sessions_changed(&mut self) -> Result<()> {
        self.sessions
            .changed()
            .await
            .map_err(|_| SupervisorGoneSnafu.build())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.is_cancelled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn closed_error(&self) -> BridgeError {
        if self.shutting_down.is_cancelled() {
            BridgeError::ShuttingDown
        } else {
            BridgeError::SupervisorGone
        }
    }
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };

                    match command {
                        SupervisorCommand::Attach(WithReplyChannel { data, reply }) => {
                            let result = self.attach(data);
                            let _ = reply.send(result);
                        }
                        SupervisorCommand::Close(WithReplyChannel { data, reply }) => {
                            let _ = reply.send(self.close(data));
                        }
                        SupervisorCommand::Shutdown(WithReplyChannel { data, reply }) => {
                            let result = self.shutdown(data).await;
                            let _ = reply.send(result);
                            break;
                        }
                    }
                }
                joined = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    if let Some(joined) = joined {
                        self.reap(joined);
                    }
                }
            }
        }
    }

    fn attach(&mut self, conn: Box<dyn SourceConnection>) -> Result<SessionId> {
        let Some(queue) = self.queue.clone() else {
            return ShuttingDownSnafu.fail();
        };

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let peer = conn.peer();
        let kill = self.kill.child_token();
        let (session, state) = Session::new(
            id,
            conn,
            queue,
            self.options.clone(),
            self.stats.clone(),
            self.drain.clone(),
            kill.clone(),
        );

        let abort_handle = self.tasks.spawn(async move { (id, session.run().await) });
        self.task_ids.insert(abort_handle.id(), id);
        self.sessions.insert(
            id,
            SessionEntry {
                slot: SessionSlot { id, peer, state },
                kill,
            },
        );
        self.publish_snapshot();

        Ok(id)
    }

    fn close(&mut self, id: SessionId) -> bool {
        let Some(entry) = self.sessions.get(&id) else {
            return false;
        };

        entry.kill.cancel();
        true
    }

    /// Stops every session, killing the ones still running at `abort_at`.
    async fn shutdown(&mut self, abort_at: Instant) -> SessionsShutdown {
        let mut result = SessionsShutdown::default();

        // Refuse new sessions and release the queue sender owned by the
        // supervisor. The queue closes when the last session ends.
        self.queue = None;
        self.drain.cancel();

        let kill_timer = tokio::time::sleep_until(abort_at);
        tokio::pin!(kill_timer);

        while !self.tasks.is_empty() {
            tokio::select! {
                joined = self.tasks.join_next_with_id() => {
                    let Some(joined) = joined else {
                        break;
                    };

                    if let Some(SessionExit::Killed) = self.reap(joined) {
                        result.killed += 1;
                    } else {
                        result.drained += 1;
                    }
                }
                _ = &mut kill_timer, if !self.kill.is_cancelled() => {
                    warn!(sessions = self.tasks.len(), "killing sessions still draining");
                    self.kill.cancel();
                }
            }
        }

        result
    }

    fn reap(
        &mut self,
        joined: std::result::Result<(task::Id, (SessionId, SessionExit)), JoinError>,
    ) -> Option<SessionExit> {
        let (task_id, exit) = match joined {
            Ok((task_id, (_, exit))) => (task_id, Some(exit)),
            Err(err) => {
                error!(err = %err, "session task failed");
                (err.id(), None)
            }
        };

        if let Some(id) = self.task_ids.remove(&task_id) {
            self.sessions.remove(&id);
            self.publish_snapshot();
        }

        exit
    }

    fn publish_snapshot(&self) {
        let mut slots = self
            .sessions
            .values()
            .map(|entry| entry.slot.clone())
            .collect::<Vec<_>>();
        slots.sort_by_key(|slot| slot.id);
        self.snapshot.send_replace(slots);
    }
}

fn log_join_error(err: JoinError) {
    error!(err = %err, "publisher task failed");
}

//! Actor loop that owns one entity instance and processes its commands.
//!
//! The actor runs on a dedicated thread and sequentially processes messages
//! from a bounded `mpsc` mailbox. It recovers its state before accepting the
//! first message, appends events through the shared [`EventLog`], and
//! restarts itself with backoff when an append fails.
//!
//! Public API: [`AggregateHandle`] (cloneable async handle) and
//! [`spawn_actor`] (factory that recovers the entity and starts the thread).
//!
//! [`EventLog`]: crate::EventLog

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::{ExecuteError, JournalError, RecoveryError, StateError};
use crate::event::{encode_domain_event, tag_for};
use crate::recovery::recover;
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};
use crate::storage::Persistence;
use crate::supervision::RestartPolicy;

/// Mailbox size used when none is configured.
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Tag slices used when none are configured.
pub(crate) const DEFAULT_TAG_SLICES: u32 = 5;

/// Configuration for the actor loop.
///
/// Internal to the crate; callers configure it through
/// [`ShardDirectoryBuilder`](crate::ShardDirectoryBuilder).
#[derive(Debug, Clone)]
pub(crate) struct ActorConfig {
    /// How long the actor waits for a message before passivating.
    pub idle_timeout: Duration,
    /// When to snapshot and how many snapshots to keep.
    pub snapshot_policy: SnapshotPolicy,
    /// Backoff applied when the instance restarts after a failed append.
    pub restart_policy: RestartPolicy,
    /// Number of tag slices events are spread across.
    pub tag_slices: u32,
    /// Bounded mailbox size.
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            // `u64::MAX / 2` avoids overflow when tokio adds the timeout
            // to the current `Instant`.
            idle_timeout: Duration::from_secs(u64::MAX / 2),
            snapshot_policy: SnapshotPolicy::default(),
            restart_policy: RestartPolicy::default(),
            tag_slices: DEFAULT_TAG_SLICES,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Reply to a successfully handled command.
#[derive(Debug, Clone)]
pub struct Executed<A: Aggregate> {
    /// Events persisted for the command (empty for reads).
    pub events: Vec<A::DomainEvent>,
    /// State after applying `events`.
    pub state: A,
    /// Highest persisted sequence number of the entity.
    pub sequence_nr: u64,
}

/// Result type sent back through the `Execute` reply channel.
pub(crate) type ExecuteResult<A> = Result<Executed<A>, ExecuteError<<A as Aggregate>::Error>>;

/// Messages sent from `AggregateHandle` to the actor loop.
pub(crate) enum ActorMessage<A: Aggregate> {
    /// Execute a command against the entity.
    Execute {
        cmd: A::Command,
        ctx: CommandContext,
        reply: oneshot::Sender<ExecuteResult<A>>,
    },

    /// Retrieve the current state.
    GetState {
        reply: oneshot::Sender<Result<A, StateError>>,
    },

    /// Finish queued work, then stop.
    Shutdown,
}

/// Why `serve` returned.
enum Exit {
    Stopped,
    Faulted,
}

/// Ways a command can fail inside the actor.
enum Failure<E> {
    /// The aggregate rejected the command.
    Rejected(E),
    /// Nothing reached the log; in-memory state is still accurate.
    Unpersisted(JournalError),
    /// The append failed; in-memory state may be stale.
    Fault(JournalError),
}

/// The live entity owned by the actor thread.
struct Instance<A: Aggregate> {
    entity_id: String,
    persistence: Persistence,
    config: ActorConfig,
    state: A,
    sequence_nr: u64,
    consecutive_failures: u32,
}

impl<A: Aggregate> Instance<A> {
    fn dispatch(&mut self, msg: ActorMessage<A>) -> Option<Exit> {
        match msg {
            ActorMessage::Execute { cmd, ctx, reply } => {
                let _span = tracing::info_span!(
                    "execute",
                    entity_type = A::AGGREGATE_TYPE,
                    entity_id = %self.entity_id,
                )
                .entered();
                let (result, exit) = match self.execute(cmd, &ctx) {
                    Ok(executed) => (Ok(executed), None),
                    Err(Failure::Rejected(e)) => (Err(ExecuteError::Domain(e)), None),
                    Err(Failure::Unpersisted(e)) => {
                        tracing::warn!(error = %e, "command produced unpersistable events");
                        (Err(ExecuteError::Persistence(e)), None)
                    }
                    Err(Failure::Fault(e)) => {
                        tracing::error!(error = %e, "persist failed; restarting entity");
                        (Err(ExecuteError::Persistence(e)), Some(Exit::Faulted))
                    }
                };
                // The caller may have timed out and dropped the receiver.
                let _ = reply.send(result);
                exit
            }

            ActorMessage::GetState { reply } => {
                let _ = reply.send(Ok(self.state.clone()));
                None
            }

            ActorMessage::Shutdown => Some(Exit::Stopped),
        }
    }

    /// Decide, persist, then apply. State changes only after the append is
    /// acknowledged.
    fn execute(
        &mut self,
        cmd: A::Command,
        ctx: &CommandContext,
    ) -> Result<Executed<A>, Failure<A::Error>> {
        let events = self
            .state
            .handle(&self.entity_id, cmd, ctx)
            .map_err(Failure::Rejected)?;

        if events.is_empty() {
            return Ok(Executed {
                events,
                state: self.state.clone(),
                sequence_nr: self.sequence_nr,
            });
        }

        let tag = tag_for::<A>(&self.entity_id, self.config.tag_slices);
        let batch = events
            .iter()
            .map(|e| encode_domain_event::<A>(e, ctx, Some(tag.clone())))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Failure::Unpersisted(JournalError::Encode(e)))?;

        let previous = self.sequence_nr;
        let persisted = self
            .persistence
            .journal
            .append(A::AGGREGATE_TYPE, &self.entity_id, previous, batch)
            .map_err(Failure::Fault)?;

        let state = std::mem::take(&mut self.state);
        self.state = events.iter().fold(state, |s, e| s.apply(e));
        self.sequence_nr = persisted.last().map_or(previous, |e| e.sequence_nr);
        self.consecutive_failures = 0;

        tracing::info!(
            count = events.len(),
            sequence_nr = self.sequence_nr,
            "events appended"
        );

        if self
            .config
            .snapshot_policy
            .should_snapshot(previous, self.sequence_nr)
        {
            spawn_snapshot::<A>(
                Arc::clone(&self.persistence.snapshots),
                self.entity_id.clone(),
                self.sequence_nr,
                self.state.clone(),
                self.config.snapshot_policy.keep,
            );
        }

        Ok(Executed {
            events,
            state: self.state.clone(),
            sequence_nr: self.sequence_nr,
        })
    }

    /// Replace in-memory state with the durable state.
    fn reload(&mut self) -> Result<(), RecoveryError> {
        let recovered = recover::<A>(
            self.persistence.journal.as_ref(),
            self.persistence.snapshots.as_ref(),
            &self.entity_id,
        )?;
        self.state = recovered.state;
        self.sequence_nr = recovered.sequence_nr;
        Ok(())
    }

    /// Recover, retrying with backoff until it succeeds or the restart
    /// limit is reached. Returns the last error in the latter case.
    fn recover_with_backoff(
        &mut self,
        rt: &tokio::runtime::Runtime,
    ) -> Result<(), RecoveryError> {
        loop {
            let err = match self.reload() {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            tracing::error!(
                entity_type = A::AGGREGATE_TYPE,
                entity_id = %self.entity_id,
                error = %err,
                "recovery failed"
            );
            if !self.back_off(rt) {
                return Err(err);
            }
        }
    }

    /// Sleep before the next restart attempt.
    ///
    /// Returns `false` once `max_restarts` consecutive attempts have failed.
    fn back_off(&mut self, rt: &tokio::runtime::Runtime) -> bool {
        let policy = self.config.restart_policy;
        if self.consecutive_failures >= policy.max_restarts {
            tracing::error!(
                entity_type = A::AGGREGATE_TYPE,
                entity_id = %self.entity_id,
                restarts = self.consecutive_failures,
                "restart limit reached; stopping entity"
            );
            return false;
        }
        let delay = policy.delay(self.consecutive_failures);
        self.consecutive_failures += 1;
        tracing::warn!(
            entity_type = A::AGGREGATE_TYPE,
            entity_id = %self.entity_id,
            attempt = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "restarting entity"
        );
        // The `Sleep` must be created inside `block_on` to find the timer.
        rt.block_on(async { tokio::time::sleep(delay).await });
        true
    }

    /// Discard in-memory state and recover again after a backoff.
    ///
    /// Returns `false` once `max_restarts` consecutive attempts have failed.
    fn restart(&mut self, rt: &tokio::runtime::Runtime) -> bool {
        self.back_off(rt) && self.recover_with_backoff(rt).is_ok()
    }
}

/// Serialize and store a snapshot off the actor thread, then prune.
///
/// Failures are logged; a missing snapshot only costs a longer replay.
fn spawn_snapshot<A: Aggregate>(
    snapshots: Arc<dyn SnapshotStore>,
    entity_id: String,
    sequence_nr: u64,
    state: A,
    keep: usize,
) {
    std::thread::spawn(move || {
        let state = match serde_json::to_value(&state) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(entity_id = %entity_id, error = %e, "failed to serialize snapshot state");
                return;
            }
        };
        let snapshot = Snapshot {
            entity_id,
            sequence_nr,
            state,
        };
        if let Err(e) = snapshots.save(A::AGGREGATE_TYPE, &snapshot) {
            tracing::warn!(entity_id = %snapshot.entity_id, error = %e, "failed to save snapshot");
            return;
        }
        match snapshots.prune(A::AGGREGATE_TYPE, &snapshot.entity_id, keep) {
            Ok(0) => {}
            Ok(removed) => {
                tracing::debug!(entity_id = %snapshot.entity_id, removed, "pruned old snapshots");
            }
            Err(e) => {
                tracing::warn!(entity_id = %snapshot.entity_id, error = %e, "failed to prune snapshots");
            }
        }
        tracing::debug!(entity_id = %snapshot.entity_id, sequence_nr, "snapshot saved");
    });
}

/// Process messages until shutdown, idle passivation, or a persistence fault.
fn serve<A: Aggregate>(
    rt: &tokio::runtime::Runtime,
    instance: &mut Instance<A>,
    rx: &mut mpsc::Receiver<ActorMessage<A>>,
) -> Exit {
    let idle_timeout = instance.config.idle_timeout;
    loop {
        // Create the timeout future INSIDE `block_on` so that the `Sleep`
        // timer registers with the local runtime's time driver.
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });

        match msg {
            Ok(Some(msg)) => {
                if let Some(exit) = instance.dispatch(msg) {
                    return exit;
                }
            }
            // Channel closed: all senders dropped.
            Ok(None) => return Exit::Stopped,
            Err(_elapsed) => {
                tracing::info!(
                    entity_type = A::AGGREGATE_TYPE,
                    entity_id = %instance.entity_id,
                    "actor idle, passivating"
                );
                // Refuse new messages but finish those already queued.
                rx.close();
                while let Some(msg) = rx.blocking_recv() {
                    if let Some(exit) = instance.dispatch(msg) {
                        return exit;
                    }
                }
                return Exit::Stopped;
            }
        }
    }
}

/// Runs the entity actor on its own thread.
///
/// Recovers the entity (retrying with backoff), reports the outcome on
/// `ready`, then serves the mailbox. On a persistence fault it restarts
/// from durable state with backoff. On exit the mailbox is closed and
/// `stopped` is set.
fn run_actor<A: Aggregate>(
    entity_id: String,
    persistence: Persistence,
    config: ActorConfig,
    mut rx: mpsc::Receiver<ActorMessage<A>>,
    ready: oneshot::Sender<Result<(), RecoveryError>>,
    stopped: watch::Sender<bool>,
) {
    // The parent runtime may be current-thread (common in tests), which
    // doesn't drive timers from non-runtime threads, so the actor gets its
    // own minimal runtime for idle timeouts and backoff sleeps.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to create actor timeout runtime");

    let mut instance = Instance {
        entity_id,
        persistence,
        config,
        state: A::default(),
        sequence_nr: 0,
        consecutive_failures: 0,
    };
    if let Err(e) = instance.recover_with_backoff(&rt) {
        let _ = ready.send(Err(e));
        let _ = stopped.send(true);
        return;
    }
    let _ = ready.send(Ok(()));

    loop {
        match serve(&rt, &mut instance, &mut rx) {
            Exit::Stopped => break,
            Exit::Faulted => {
                if !instance.restart(&rt) {
                    break;
                }
            }
        }
    }

    // Anything still queued is dropped; its callers observe `ActorGone`.
    rx.close();
    drop(rx);
    let _ = stopped.send(true);
}

/// Async handle to a running entity actor.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the
/// actor thread over a bounded channel.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    entity_id: Arc<str>,
    sender: mpsc::Sender<ActorMessage<A>>,
    stopped: watch::Receiver<bool>,
}

// Manual `Clone`: only the channel ends are cloned.
impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            entity_id: Arc::clone(&self.entity_id),
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// ID of the entity behind this handle.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Send a command to the entity and wait for the result.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`]: the aggregate rejected the command.
    /// * [`ExecuteError::Persistence`]: the append failed; the entity restarts.
    /// * [`ExecuteError::ActorGone`]: the actor thread has exited.
    pub async fn execute(
        &self,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        let (tx, rx) = oneshot::channel();
        self.deliver(ActorMessage::Execute {
            cmd,
            ctx,
            reply: tx,
        })
        .await
        .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Read the current state.
    ///
    /// # Errors
    ///
    /// [`StateError::ActorGone`] if the actor thread has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        let (tx, rx) = oneshot::channel();
        self.deliver(ActorMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)?
    }

    /// Enqueue a message, handing it back if the mailbox is closed.
    pub(crate) async fn deliver(&self, msg: ActorMessage<A>) -> Result<(), ActorMessage<A>> {
        self.sender.send(msg).await.map_err(|e| e.0)
    }

    /// Check whether the actor still accepts messages.
    ///
    /// Returns `false` once the actor has begun passivating or has exited.
    /// The directory uses this to replace stale handles.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Wait until the actor thread has finished all work and exited.
    pub async fn terminated(&self) {
        let mut stopped = self.stopped.clone();
        // A dropped sender also means the thread is gone.
        let _ = stopped.wait_for(|s| *s).await;
    }

    /// Ask the actor to stop after its queued messages, and wait for it.
    pub async fn stop(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
        self.terminated().await;
    }
}

/// Recover an entity and start its actor with explicit configuration.
///
/// Recovery runs on the actor thread; this resolves once the entity is
/// ready to accept commands.
///
/// # Errors
///
/// Returns [`RecoveryError`] if the entity's history cannot be replayed.
pub(crate) async fn spawn_actor_with_config<A: Aggregate>(
    entity_id: &str,
    persistence: Persistence,
    config: ActorConfig,
) -> Result<AggregateHandle<A>, RecoveryError> {
    let (tx, rx) = mpsc::channel::<ActorMessage<A>>(config.mailbox_capacity.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stopped_tx, stopped_rx) = watch::channel(false);

    let id = entity_id.to_owned();
    std::thread::spawn(move || {
        run_actor::<A>(id, persistence, config, rx, ready_tx, stopped_tx);
    });

    let handle = AggregateHandle {
        entity_id: Arc::from(entity_id),
        sender: tx,
        stopped: stopped_rx,
    };
    match ready_rx.await {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => Err(e),
        // The thread died before reporting; callers see `ActorGone`.
        Err(_) => Ok(handle),
    }
}

/// Recover an entity and start its actor with default settings.
///
/// The actor never idles out. For configurable timeouts, snapshots, and
/// restart backoff, use a [`ShardDirectory`](crate::ShardDirectory).
///
/// # Errors
///
/// Returns [`RecoveryError`] if the entity's history cannot be replayed.
pub async fn spawn_actor<A: Aggregate>(
    entity_id: &str,
    persistence: Persistence,
) -> Result<AggregateHandle<A>, RecoveryError> {
    spawn_actor_with_config(entity_id, persistence, ActorConfig::default()).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand, CounterError, CounterEvent};
    use crate::event::NewEvent;
    use crate::journal::test_fixtures::FlakyLog;
    use crate::journal::MemoryEventLog;
    use crate::snapshot::MemorySnapshotStore;

    fn fast_restarts() -> RestartPolicy {
        RestartPolicy {
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            random_factor: 0.0,
            max_restarts: 5,
        }
    }

    #[tokio::test]
    async fn execute_increment_three_times() {
        let handle = spawn_actor::<Counter>("c-1", Persistence::in_memory())
            .await
            .expect("spawn_actor should succeed");

        let ctx = CommandContext::default();
        for expected in 1..=3 {
            let done = handle
                .execute(CounterCommand::Increment, ctx.clone())
                .await
                .expect("execute should succeed");
            assert_eq!(done.sequence_nr, expected);
            assert_eq!(done.state.value, expected);
        }

        let state = handle.state().await.expect("state should succeed");
        assert_eq!(state.value, 3);
    }

    #[tokio::test]
    async fn rejected_command_persists_nothing() {
        let persistence = Persistence::in_memory();
        let handle = spawn_actor::<Counter>("c-1", persistence.clone())
            .await
            .expect("spawn_actor should succeed");

        let result = handle
            .execute(CounterCommand::Decrement, CommandContext::default())
            .await;

        assert!(
            matches!(result, Err(ExecuteError::Domain(CounterError::AlreadyZero))),
            "expected Domain(AlreadyZero), got: {result:?}"
        );
        assert_eq!(
            persistence.journal.highest_sequence_nr("counter", "c-1").unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn read_command_returns_state_without_appending() {
        let persistence = Persistence::in_memory();
        let handle = spawn_actor::<Counter>("c-1", persistence.clone())
            .await
            .unwrap();
        handle
            .execute(CounterCommand::Add(4), CommandContext::default())
            .await
            .unwrap();

        let read = handle
            .execute(CounterCommand::Read, CommandContext::default())
            .await
            .unwrap();
        assert!(read.events.is_empty());
        assert_eq!(read.state.value, 4);
        assert_eq!(read.sequence_nr, 1);
        assert_eq!(persistence.journal.read_all(0, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persisted_events_carry_tag_and_context() {
        let persistence = Persistence::in_memory();
        let handle = spawn_actor::<Counter>("c-1", persistence.clone())
            .await
            .unwrap();

        let ctx = CommandContext::default().with_actor("user-7");
        let done = handle
            .execute(CounterCommand::Increment, ctx)
            .await
            .unwrap();
        assert_eq!(done.events, vec![CounterEvent::Incremented]);

        let stored = persistence.journal.read_stream("counter", "c-1", 0).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].tag.as_deref(),
            Some(tag_for::<Counter>("c-1", DEFAULT_TAG_SLICES).as_str())
        );
        assert_eq!(stored[0].metadata["actor"], "user-7");
    }

    #[tokio::test]
    async fn state_persists_across_respawn() {
        let persistence = Persistence::in_memory();
        {
            let handle = spawn_actor::<Counter>("c-1", persistence.clone())
                .await
                .unwrap();
            let ctx = CommandContext::default();
            handle
                .execute(CounterCommand::Increment, ctx.clone())
                .await
                .unwrap();
            handle.execute(CounterCommand::Add(10), ctx).await.unwrap();
            handle.stop().await;
            assert!(!handle.is_alive());
        }

        let handle = spawn_actor::<Counter>("c-1", persistence)
            .await
            .expect("respawn should succeed");
        let state = handle.state().await.expect("state should succeed");
        assert_eq!(state.value, 11);
    }

    #[tokio::test]
    async fn snapshots_are_taken_and_pruned() {
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let persistence = Persistence::new(Arc::new(MemoryEventLog::new()), snapshots.clone());
        let config = ActorConfig {
            snapshot_policy: SnapshotPolicy { every: 5, keep: 2 },
            ..ActorConfig::default()
        };
        let handle =
            spawn_actor_with_config::<Counter>("c-1", persistence.clone(), config)
                .await
                .unwrap();

        for _ in 0..16 {
            handle
                .execute(CounterCommand::Increment, CommandContext::default())
                .await
                .unwrap();
        }

        // Snapshots are written on background threads.
        let mut seqs = Vec::new();
        for _ in 0..100 {
            seqs = snapshots.sequence_nrs("counter", "c-1");
            if seqs == vec![10, 15] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seqs, vec![10, 15]);

        handle.stop().await;
        let recovered = recover::<Counter>(
            persistence.journal.as_ref(),
            persistence.snapshots.as_ref(),
            "c-1",
        )
        .unwrap();
        assert_eq!(recovered.state.value, 16);
        assert_eq!(recovered.from_snapshot, Some(15));
        assert_eq!(recovered.replayed, 1);
    }

    #[tokio::test]
    async fn failed_append_restarts_from_durable_state() {
        let log = Arc::new(FlakyLog::default());
        let persistence = Persistence::new(log.clone(), Arc::new(MemorySnapshotStore::new()));
        let config = ActorConfig {
            restart_policy: fast_restarts(),
            ..ActorConfig::default()
        };
        let handle = spawn_actor_with_config::<Counter>("c-1", persistence, config)
            .await
            .unwrap();

        handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap();

        log.fail_next(1);
        let err = handle
            .execute(CounterCommand::Add(100), CommandContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Persistence(_)), "got: {err:?}");

        // Queued behind the restart; served once recovery finishes.
        let done = handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .expect("entity should be serving again");
        assert_eq!(done.state.value, 2);
        assert_eq!(done.sequence_nr, 2);
    }

    #[tokio::test]
    async fn foreign_append_is_detected_and_state_reloaded() {
        let persistence = Persistence::in_memory();
        let config = ActorConfig {
            restart_policy: fast_restarts(),
            ..ActorConfig::default()
        };
        let handle = spawn_actor_with_config::<Counter>("c-1", persistence.clone(), config)
            .await
            .unwrap();
        handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap();

        // Another writer sneaks an event into the same stream.
        persistence
            .journal
            .append(
                "counter",
                "c-1",
                1,
                vec![NewEvent {
                    event_type: "Added".into(),
                    payload: serde_json::json!({"amount": 40}),
                    metadata: Value::Null,
                    tag: None,
                }],
            )
            .unwrap();

        let err = handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                ExecuteError::Persistence(JournalError::SequenceConflict { .. })
            ),
            "got: {err:?}"
        );

        let state = handle.state().await.unwrap();
        assert_eq!(state.value, 41);
    }

    #[tokio::test]
    async fn undecodable_history_fails_spawn() {
        let persistence = Persistence::in_memory();
        persistence
            .journal
            .append(
                "counter",
                "c-1",
                0,
                vec![NewEvent {
                    event_type: "Added".into(),
                    payload: serde_json::json!({"amount": "many"}),
                    metadata: Value::Null,
                    tag: None,
                }],
            )
            .unwrap();

        let config = ActorConfig {
            restart_policy: RestartPolicy {
                max_restarts: 2,
                ..fast_restarts()
            },
            ..ActorConfig::default()
        };
        let err = spawn_actor_with_config::<Counter>("c-1", persistence, config)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Decode { sequence_nr: 1, .. }));
    }

    #[tokio::test]
    async fn transient_read_failure_is_retried_before_serving() {
        let log = Arc::new(FlakyLog::default());
        let persistence = Persistence::new(log.clone(), Arc::new(MemorySnapshotStore::new()));
        persistence
            .journal
            .append(
                "counter",
                "c-1",
                0,
                vec![NewEvent {
                    event_type: "Added".into(),
                    payload: serde_json::json!({"amount": 7}),
                    metadata: Value::Null,
                    tag: None,
                }],
            )
            .unwrap();

        log.fail_next_reads(2);
        let config = ActorConfig {
            restart_policy: fast_restarts(),
            ..ActorConfig::default()
        };
        let handle = spawn_actor_with_config::<Counter>("c-1", persistence, config)
            .await
            .expect("recovery should succeed after retries");
        let done = handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .unwrap();
        assert_eq!(done.state.value, 8);
        assert_eq!(done.sequence_nr, 2);
    }

    #[tokio::test]
    async fn persistent_read_failure_gives_up_after_restart_limit() {
        let log = Arc::new(FlakyLog::default());
        let persistence = Persistence::new(log.clone(), Arc::new(MemorySnapshotStore::new()));
        log.fail_next_reads(100);
        let config = ActorConfig {
            restart_policy: RestartPolicy {
                max_restarts: 3,
                ..fast_restarts()
            },
            ..ActorConfig::default()
        };
        let err = spawn_actor_with_config::<Counter>("c-1", persistence, config)
            .await
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Journal { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn idle_timeout_passivates_actor() {
        let persistence = Persistence::in_memory();
        let config = ActorConfig {
            idle_timeout: Duration::from_millis(200),
            ..ActorConfig::default()
        };
        let handle = spawn_actor_with_config::<Counter>("c-1", persistence.clone(), config)
            .await
            .unwrap();

        handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await
            .expect("first execute should succeed");

        tokio::time::timeout(Duration::from_secs(2), handle.terminated())
            .await
            .expect("actor should terminate after idling");
        assert!(!handle.is_alive(), "actor should be dead after idle timeout");

        let result = handle
            .execute(CounterCommand::Increment, CommandContext::default())
            .await;
        assert!(matches!(result, Err(ExecuteError::ActorGone)));

        let handle2 = spawn_actor::<Counter>("c-1", persistence)
            .await
            .expect("respawn should succeed");
        let state = handle2.state().await.expect("state should succeed");
        assert_eq!(state.value, 1, "state should reflect the first command");
    }

    #[tokio::test]
    async fn rapid_commands_prevent_idle_eviction() {
        let config = ActorConfig {
            idle_timeout: Duration::from_millis(300),
            ..ActorConfig::default()
        };
        let handle = spawn_actor_with_config::<Counter>("c-1", Persistence::in_memory(), config)
            .await
            .unwrap();

        let ctx = CommandContext::default();
        for _ in 0..5 {
            handle
                .execute(CounterCommand::Increment, ctx.clone())
                .await
                .expect("execute should succeed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(
            handle.is_alive(),
            "actor should still be alive during activity"
        );
        let state = handle.state().await.expect("state should succeed");
        assert_eq!(state.value, 5);
    }

    #[tokio::test]
    async fn concurrent_commands_are_serialized() {
        let handle = spawn_actor::<Counter>("c-1", Persistence::in_memory())
            .await
            .unwrap();

        let pending: Vec<_> = (0..10)
            .map(|_| {
                let h = handle.clone();
                tokio::spawn(async move {
                    h.execute(CounterCommand::Increment, CommandContext::default())
                        .await
                })
            })
            .collect();
        let mut seqs = Vec::new();
        for task in pending {
            seqs.push(task.await.unwrap().expect("command should complete").sequence_nr);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());

        handle.stop().await;
        assert!(!handle.is_alive());
    }
}

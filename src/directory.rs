//! Shard directory: the routing layer that keeps at most one live instance
//! per entity and delivers commands to it.
//!
//! Each node runs one [`ShardDirectory`] per aggregate type. An entity ID is
//! mapped to a shard, the shard to its owner node through a
//! [`ShardAllocation`], and the command is either executed by a local actor
//! (spawned on demand) or forwarded to the owner through a [`ShardPeer`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::actor::{
    ActorConfig, ActorMessage, AggregateHandle, DEFAULT_MAILBOX_CAPACITY, DEFAULT_TAG_SLICES,
    Executed, spawn_actor_with_config,
};
use crate::aggregate::Aggregate;
use crate::command::CommandContext;
use crate::error::{ExecuteError, StateError};
use crate::routing::{
    DEFAULT_NUMBER_OF_SHARDS, NodeId, ShardAllocation, ShardId, SingleNode, shard_for,
};
use crate::snapshot::SnapshotPolicy;
use crate::storage::Persistence;
use crate::supervision::RestartPolicy;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How often a command is re-delivered when the instance it was routed to
/// stopped before accepting it.
const DELIVERY_ATTEMPTS: usize = 3;

/// At most one handle per entity. The async mutex serializes spawning, so
/// two callers never start the same entity twice.
type Slot<A> = Arc<tokio::sync::Mutex<Option<AggregateHandle<A>>>>;

/// Remote side of a directory: executes commands for entities it owns.
///
/// [`ShardDirectory`] implements this trait itself, so in-process clusters
/// connect directories directly. A networked deployment would implement it
/// over its transport of choice.
#[async_trait]
pub trait ShardPeer<A: Aggregate>: Send + Sync {
    /// Execute a command on an entity owned by this peer.
    ///
    /// Must not forward again: a peer that does not own the entity returns
    /// [`ExecuteError::Unroutable`].
    async fn execute_local(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>>;

    /// Read the state of an entity owned by this peer.
    async fn state_local(&self, entity_id: &str) -> Result<A, StateError>;
}

struct Inner<A: Aggregate> {
    node_id: NodeId,
    persistence: Persistence,
    config: ActorConfig,
    number_of_shards: u32,
    allocation: RwLock<Arc<dyn ShardAllocation>>,
    slots: Mutex<HashMap<String, Slot<A>>>,
    peers: RwLock<HashMap<NodeId, Arc<dyn ShardPeer<A>>>>,
    // Commands hold it shared while routing and enqueueing; allocation
    // changes and shutdown hold it exclusively.
    routing: tokio::sync::RwLock<()>,
    closed: AtomicBool,
}

/// Routes commands for one aggregate type to live entity instances.
///
/// `Clone` is cheap; all internal state is `Arc`-wrapped.
pub struct ShardDirectory<A: Aggregate> {
    inner: Arc<Inner<A>>,
}

impl<A: Aggregate> Clone for ShardDirectory<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for ShardDirectory<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardDirectory")
            .field("entity_type", &A::AGGREGATE_TYPE)
            .field("node_id", &self.inner.node_id)
            .field("number_of_shards", &self.inner.number_of_shards)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> ShardDirectory<A> {
    /// This node's identity.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Shard an entity belongs to.
    pub fn shard_for(&self, entity_id: &str) -> ShardId {
        shard_for(A::AGGREGATE_TYPE, entity_id, self.inner.number_of_shards)
    }

    fn owner_of(&self, entity_id: &str) -> NodeId {
        let allocation = Arc::clone(
            &self
                .inner
                .allocation
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        );
        allocation.owner(self.shard_for(entity_id))
    }

    fn peer(&self, node: &NodeId) -> Option<Arc<dyn ShardPeer<A>>> {
        self.inner
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }

    fn slot(&self, entity_id: &str) -> Slot<A> {
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(entity_id.to_owned()).or_default())
    }

    /// Register the directory that serves shards allocated to `node`.
    pub fn connect_peer(&self, node: impl Into<NodeId>, peer: Arc<dyn ShardPeer<A>>) {
        let node = node.into();
        tracing::debug!(local = %self.inner.node_id, peer = %node, "peer connected");
        self.inner
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, peer);
    }

    /// Send a command to an entity and wait at most `timeout` for the reply.
    ///
    /// Equivalent to [`ask_with_context`](Self::ask_with_context) with a
    /// default context.
    pub async fn ask(
        &self,
        entity_id: &str,
        cmd: A::Command,
        timeout: Duration,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        self.ask_with_context(entity_id, cmd, CommandContext::default(), timeout)
            .await
    }

    /// Send a command to an entity and wait at most `timeout` for the reply.
    ///
    /// The entity is started on its owner node if it is not running. A
    /// timeout does not cancel the command; it may still take effect.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`]: the aggregate rejected the command.
    /// * [`ExecuteError::Timeout`]: no reply within `timeout`.
    /// * [`ExecuteError::Recovery`]: the entity could not be recovered within its restart limit.
    /// * [`ExecuteError::Unroutable`]: the owner node is not connected.
    /// * [`ExecuteError::Persistence`] / [`ExecuteError::ActorGone`]: the
    ///   instance failed while handling the command.
    pub async fn ask_with_context(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
        timeout: Duration,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        match tokio::time::timeout(timeout, self.route(entity_id, cmd, ctx)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    entity_type = A::AGGREGATE_TYPE,
                    entity_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "ask timed out"
                );
                Err(ExecuteError::Timeout(timeout))
            }
        }
    }

    /// Read an entity's current state, waiting at most `timeout`.
    pub async fn state(&self, entity_id: &str, timeout: Duration) -> Result<A, StateError> {
        let owner = self.owner_of(entity_id);
        let read = async {
            if owner == self.inner.node_id {
                return self.state_here(entity_id).await;
            }
            match self.peer(&owner) {
                Some(peer) => peer.state_local(entity_id).await,
                None => Err(StateError::Unroutable {
                    entity_id: entity_id.to_owned(),
                    owner: owner.to_string(),
                }),
            }
        };
        tokio::time::timeout(timeout, read)
            .await
            .unwrap_or(Err(StateError::Timeout(timeout)))
    }

    async fn route(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        let owner = self.owner_of(entity_id);
        if owner == self.inner.node_id {
            return self.execute_here(entity_id, cmd, ctx).await;
        }
        let Some(peer) = self.peer(&owner) else {
            return Err(ExecuteError::Unroutable {
                entity_id: entity_id.to_owned(),
                owner: owner.to_string(),
            });
        };
        tracing::debug!(entity_id, owner = %owner, "forwarding command to owner");
        peer.execute_local(entity_id, cmd, ctx).await
    }

    /// Live handle for a locally owned entity, spawning it if needed.
    async fn local_handle(
        &self,
        entity_id: &str,
    ) -> Result<AggregateHandle<A>, crate::error::RecoveryError> {
        let slot = self.slot(entity_id);
        let mut current = slot.lock().await;
        if let Some(handle) = current.as_ref() {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            // Passivating: let it drain so the successor recovers every event.
            handle.terminated().await;
        }

        tracing::debug!(
            entity_type = A::AGGREGATE_TYPE,
            entity_id,
            node = %self.inner.node_id,
            "spawning actor"
        );
        let handle = spawn_actor_with_config::<A>(
            entity_id,
            self.inner.persistence.clone(),
            self.inner.config.clone(),
        )
        .await?;
        *current = Some(handle.clone());
        Ok(handle)
    }

    async fn execute_here(
        &self,
        entity_id: &str,
        mut cmd: A::Command,
        mut ctx: CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        let routing = self.inner.routing.read().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExecuteError::ActorGone);
        }
        let owner = self.owner_of(entity_id);
        if owner != self.inner.node_id {
            return Err(ExecuteError::Unroutable {
                entity_id: entity_id.to_owned(),
                owner: owner.to_string(),
            });
        }

        for _ in 0..DELIVERY_ATTEMPTS {
            let handle = self.local_handle(entity_id).await?;
            let (tx, rx) = oneshot::channel();
            let msg = ActorMessage::Execute {
                cmd,
                ctx,
                reply: tx,
            };
            match handle.deliver(msg).await {
                Ok(()) => {
                    // Enqueued; an allocation change now drains it first.
                    drop(routing);
                    return rx.await.unwrap_or(Err(ExecuteError::ActorGone));
                }
                // The instance began passivating between lookup and send.
                Err(ActorMessage::Execute { cmd: c, ctx: x, .. }) => {
                    cmd = c;
                    ctx = x;
                }
                Err(_) => break,
            }
        }
        Err(ExecuteError::ActorGone)
    }

    async fn state_here(&self, entity_id: &str) -> Result<A, StateError> {
        let routing = self.inner.routing.read().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StateError::ActorGone);
        }
        let owner = self.owner_of(entity_id);
        if owner != self.inner.node_id {
            return Err(StateError::Unroutable {
                entity_id: entity_id.to_owned(),
                owner: owner.to_string(),
            });
        }

        for _ in 0..DELIVERY_ATTEMPTS {
            let handle = self.local_handle(entity_id).await?;
            let (tx, rx) = oneshot::channel();
            if handle
                .deliver(ActorMessage::GetState { reply: tx })
                .await
                .is_ok()
            {
                drop(routing);
                return rx.await.unwrap_or(Err(StateError::ActorGone));
            }
        }
        Err(StateError::ActorGone)
    }

    /// Stop an entity's local instance after it finishes queued work.
    ///
    /// The next command starts a fresh instance from durable state.
    pub async fn passivate(&self, entity_id: &str) {
        let slot = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned();
        let Some(slot) = slot else {
            return;
        };
        // Holding the slot blocks a concurrent respawn until the old
        // instance is gone.
        let mut current = slot.lock().await;
        if let Some(handle) = current.take() {
            handle.stop().await;
            tracing::debug!(entity_id, "entity passivated");
        }
    }

    /// IDs of entities with a live local instance, sorted.
    pub async fn live_instances(&self) -> Vec<String> {
        let slots: Vec<(String, Slot<A>)> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        let mut live = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.as_ref().is_some_and(|h| h.is_alive()) {
                live.push(id);
            }
        }
        live.sort();
        live
    }

    /// Switch to a new shard allocation.
    ///
    /// Local instances whose shard moves to another node finish their
    /// queued commands and stop before the new allocation takes effect.
    /// Commands arriving meanwhile wait, then route by the new allocation.
    /// Apply the change on nodes losing shards before nodes gaining them.
    pub async fn update_allocation(&self, allocation: Arc<dyn ShardAllocation>) {
        let _exclusive = self.inner.routing.write().await;
        let slots: Vec<(String, Slot<A>)> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut moved = 0usize;
        for (id, slot) in slots {
            if allocation.owner(self.shard_for(&id)) == self.inner.node_id {
                continue;
            }
            let mut current = slot.lock().await;
            if let Some(handle) = current.take() {
                handle.stop().await;
                moved += 1;
            }
        }

        *self
            .inner
            .allocation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = allocation;
        tracing::info!(node = %self.inner.node_id, moved, "shard allocation updated");
    }

    /// Stop every local instance and refuse further commands.
    pub async fn shutdown(&self) {
        let _exclusive = self.inner.routing.write().await;
        self.inner.closed.store(true, Ordering::Release);
        let slots: Vec<Slot<A>> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            if let Some(handle) = slot.lock().await.take() {
                handle.stop().await;
            }
        }
        self.inner
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(node = %self.inner.node_id, "shard directory shut down");
    }
}

#[async_trait]
impl<A: Aggregate> ShardPeer<A> for ShardDirectory<A> {
    async fn execute_local(
        &self,
        entity_id: &str,
        cmd: A::Command,
        ctx: CommandContext,
    ) -> Result<Executed<A>, ExecuteError<A::Error>> {
        self.execute_here(entity_id, cmd, ctx).await
    }

    async fn state_local(&self, entity_id: &str) -> Result<A, StateError> {
        self.state_here(entity_id).await
    }
}

/// Builder for a [`ShardDirectory`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use shopping_cart_es::{Persistence, ShardDirectoryBuilder, ShoppingCart};
///
/// let carts = ShardDirectoryBuilder::new(Persistence::in_memory())
///     .node_id("node-1")
///     .idle_timeout(Duration::from_secs(120))
///     .snapshot_every(100)
///     .keep_snapshots(3)
///     .build::<ShoppingCart>();
/// assert_eq!(carts.node_id().as_str(), "node-1");
/// ```
#[derive(Debug, Clone)]
pub struct ShardDirectoryBuilder {
    persistence: Persistence,
    node_id: NodeId,
    allocation: Option<Arc<dyn ShardAllocation>>,
    number_of_shards: u32,
    config: ActorConfig,
}

impl ShardDirectoryBuilder {
    /// Start a builder over `persistence` with default settings: node
    /// `"local"` owning all 100 shards, a 5 minute idle timeout, snapshots
    /// every 100 events keeping 3, and 5 tag slices.
    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            node_id: NodeId::new("local"),
            allocation: None,
            number_of_shards: DEFAULT_NUMBER_OF_SHARDS,
            config: ActorConfig {
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
                snapshot_policy: SnapshotPolicy::default(),
                restart_policy: RestartPolicy::default(),
                tag_slices: DEFAULT_TAG_SLICES,
                mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            },
        }
    }

    /// This node's identity.
    pub fn node_id(mut self, node: impl Into<NodeId>) -> Self {
        self.node_id = node.into();
        self
    }

    /// Shard allocation. Defaults to this node owning every shard.
    pub fn allocation(mut self, allocation: Arc<dyn ShardAllocation>) -> Self {
        self.allocation = Some(allocation);
        self
    }

    /// Number of shards. Must match across the cluster.
    pub fn number_of_shards(mut self, shards: u32) -> Self {
        self.number_of_shards = shards.max(1);
        self
    }

    /// Idle time after which an instance passivates.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Snapshot every `events` events (0 disables snapshots).
    pub fn snapshot_every(mut self, events: u64) -> Self {
        self.config.snapshot_policy.every = events;
        self
    }

    /// Snapshots retained per entity.
    pub fn keep_snapshots(mut self, keep: usize) -> Self {
        self.config.snapshot_policy.keep = keep.max(1);
        self
    }

    /// Restart backoff for failed instances.
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.config.restart_policy = policy;
        self
    }

    /// Number of tag slices events are spread across.
    pub fn tag_slices(mut self, slices: u32) -> Self {
        self.config.tag_slices = slices.max(1);
        self
    }

    /// Mailbox size of each instance.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity.max(1);
        self
    }

    /// Build the directory for aggregate type `A`.
    pub fn build<A: Aggregate>(self) -> ShardDirectory<A> {
        let allocation = match self.allocation {
            Some(allocation) => allocation,
            None => Arc::new(SingleNode::new(self.node_id.clone())),
        };
        ShardDirectory {
            inner: Arc::new(Inner {
                node_id: self.node_id,
                persistence: self.persistence,
                config: self.config,
                number_of_shards: self.number_of_shards,
                allocation: RwLock::new(allocation),
                slots: Mutex::new(HashMap::new()),
                peers: RwLock::new(HashMap::new()),
                routing: tokio::sync::RwLock::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

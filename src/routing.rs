//! Shard selection and shard-to-node allocation.
//!
//! An entity's shard is a stable hash of its type and ID, so every node
//! agrees on it without coordination. Which node hosts a shard is decided by
//! a [`ShardAllocation`]: [`SingleNode`] for one process, or a consistent
//! [`HashRing`] for several.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::bucket_for;

/// Index of a shard in `0..number_of_shards`.
pub type ShardId = u32;

/// Shards used when none are configured.
pub const DEFAULT_NUMBER_OF_SHARDS: u32 = 100;

/// Namespace for ring positions, distinct from entity hashing.
const RING_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x71, 0x0a, 0x55, 0xe2, 0x94, 0x4b, 0x07, 0x9d, 0x18, 0x6f, 0xa3, 0x21, 0xc8, 0x5e, 0x40,
]);

/// Identity of a node hosting entity instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap a node name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Shard of an entity. Stable for a fixed `number_of_shards`.
pub fn shard_for(entity_type: &str, entity_id: &str, number_of_shards: u32) -> ShardId {
    bucket_for(entity_type, entity_id, number_of_shards)
}

/// Decides which node hosts each shard.
///
/// Every node of a cluster must be configured with an equivalent
/// allocation so they agree on ownership.
pub trait ShardAllocation: Send + Sync + fmt::Debug + 'static {
    /// Node that owns `shard`.
    fn owner(&self, shard: ShardId) -> NodeId;
}

/// Every shard lives on one node.
#[derive(Debug, Clone)]
pub struct SingleNode {
    node: NodeId,
}

impl SingleNode {
    /// Allocate all shards to `node`.
    pub fn new(node: impl Into<NodeId>) -> Self {
        Self { node: node.into() }
    }
}

impl ShardAllocation for SingleNode {
    fn owner(&self, _shard: ShardId) -> NodeId {
        self.node.clone()
    }
}

/// Consistent hash ring over a set of nodes.
///
/// Each node is placed at `virtual_nodes` pseudo-random points; a shard
/// belongs to the first point at or after its own hash. Adding or removing
/// a node only moves the shards adjacent to its points.
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: BTreeMap<u128, NodeId>,
}

/// Error building a [`HashRing`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    /// No nodes were supplied.
    #[error("hash ring needs at least one node")]
    Empty,
    /// `virtual_nodes` was zero.
    #[error("hash ring needs at least one virtual node per node")]
    NoVirtualNodes,
}

impl HashRing {
    /// Build a ring with `virtual_nodes` points per node.
    ///
    /// # Errors
    ///
    /// [`RingError`] if `nodes` is empty or `virtual_nodes` is zero.
    pub fn new(
        nodes: impl IntoIterator<Item = NodeId>,
        virtual_nodes: u32,
    ) -> Result<Self, RingError> {
        if virtual_nodes == 0 {
            return Err(RingError::NoVirtualNodes);
        }
        let mut ring = BTreeMap::new();
        for node in nodes {
            for v in 0..virtual_nodes {
                let point = Uuid::new_v5(&RING_NAMESPACE, format!("{node}#{v}").as_bytes());
                ring.insert(point.as_u128(), node.clone());
            }
        }
        if ring.is_empty() {
            return Err(RingError::Empty);
        }
        Ok(Self { ring })
    }

    /// Distinct nodes on the ring.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.ring.values().cloned().collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

impl ShardAllocation for HashRing {
    fn owner(&self, shard: ShardId) -> NodeId {
        let point = Uuid::new_v5(&RING_NAMESPACE, format!("shard-{shard}").as_bytes()).as_u128();
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.clone())
            // `new` rejects empty rings.
            .unwrap_or_else(|| NodeId::new(""))
    }
}

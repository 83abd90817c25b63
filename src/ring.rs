//! Consistent-hashing ring: the stable 32-bit key hash, node descriptors,
//! and the immutable sorted ring view that defines key ownership.

use std::fmt;
use std::net::SocketAddr;

use crate::utils::LeaseKvError;

use serde::{Deserialize, Serialize};

/// Node identifier type: the node's position on the hash ring.
pub type NodeId = u32;

/// FNV-1a 32-bit hash of a key's bytes. Every participant (client library
/// and all storage nodes) must map keys through this exact function, or key
/// ownership would diverge across the cluster.
pub fn store_hash(key: &str) -> u32 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;

    let mut hash = FNV_OFFSET;
    for &byte in key.as_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Descriptor of one storage node: its ring position and dialable address.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub struct NodeDesc {
    /// Position on the hash ring.
    pub id: NodeId,

    /// Client-facing API address of the node.
    pub addr: SocketAddr,
}

impl fmt::Display for NodeDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// The published ring view: node descriptors sorted ascending by ID.
/// Immutable once constructed; both sides of the protocol binary-search it
/// for the owner of a key.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RingView {
    nodes: Vec<NodeDesc>,
}

impl RingView {
    /// Builds a ring view from descriptors in any order. Rejects empty
    /// inputs and duplicate IDs.
    pub fn assemble(
        mut nodes: Vec<NodeDesc>,
    ) -> Result<Self, LeaseKvError> {
        if nodes.is_empty() {
            return Err(LeaseKvError::msg("cannot assemble an empty ring"));
        }
        nodes.sort_unstable_by_key(|n| n.id);
        if nodes.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(LeaseKvError::msg("duplicate node ID in ring"));
        }
        Ok(RingView { nodes })
    }

    /// All nodes in ascending ID order.
    pub fn nodes(&self) -> &[NodeDesc] {
        &self.nodes
    }

    /// Number of nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring is empty (never true for an assembled view).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node owning hash value `hash`: the first node with ID >= hash,
    /// wrapping around to the lowest-ID node.
    pub fn owner_of_hash(&self, hash: u32) -> &NodeDesc {
        match self.nodes.binary_search_by_key(&hash, |n| n.id) {
            Ok(idx) => &self.nodes[idx],
            Err(idx) if idx == self.nodes.len() => &self.nodes[0],
            Err(idx) => &self.nodes[idx],
        }
    }

    /// The node owning `key`.
    pub fn owner_of(&self, key: &str) -> &NodeDesc {
        self.owner_of_hash(store_hash(key))
    }

    /// Whether the node with ID `me` owns hash value `hash` on this ring,
    /// i.e. `hash` lies in the half-open range `(predecessor, me]` with
    /// wrap-around for the lowest-ID node.
    pub fn owned_by(&self, me: NodeId, hash: u32) -> bool {
        self.owner_of_hash(hash).id == me
    }
}

//! Cluster partition ownership map.
//!
//! Each partition has exactly one active owner; only `ActiveOwner`
//! partitions are scanned by queries. Membership itself (join/leave,
//! rebalancing) is an external collaborator; this map is the read side
//! the query path consumes.

use std::collections::HashMap;

use evq_common::{NodeId, PartitionId};

/// Ownership state of a partition on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The one scannable owner of the partition.
    ActiveOwner,
    /// A passive copy; never scanned.
    ActiveClone,
    /// Assigned but not serving.
    Offline,
}

/// `partition → (node, state)` table.
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    entries: HashMap<u32, (NodeId, NodeState)>,
}

impl PartitionMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with every partition owned by one node (single-node cluster).
    pub fn single_node(node: NodeId, partition_max: u32) -> Self {
        let mut map = Self::new();
        for p in 0..partition_max {
            map.assign(PartitionId(p), node, NodeState::ActiveOwner);
        }
        map
    }

    /// Assign or reassign a partition.
    pub fn assign(&mut self, partition: PartitionId, node: NodeId, state: NodeState) {
        self.entries.insert(partition.0, (node, state));
    }

    /// The active owner of a partition, if any.
    pub fn owner(&self, partition: PartitionId) -> Option<NodeId> {
        self.entries
            .get(&partition.0)
            .filter(|(_, state)| *state == NodeState::ActiveOwner)
            .map(|(node, _)| *node)
    }

    /// True when `node` is the active owner of `partition`.
    pub fn is_owner(&self, partition: PartitionId, node: NodeId) -> bool {
        self.owner(partition) == Some(node)
    }

    /// Partitions held by `node` in any of `states`, ascending.
    pub fn partitions_for_node(&self, node: NodeId, states: &[NodeState]) -> Vec<PartitionId> {
        let mut out: Vec<PartitionId> = self
            .entries
            .iter()
            .filter(|(_, (n, s))| *n == node && states.contains(s))
            .map(|(p, _)| PartitionId(*p))
            .collect();
        out.sort();
        out
    }

    /// Nodes owning at least one active partition, ascending.
    pub fn nodes_with_active_partitions(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .entries
            .values()
            .filter(|(_, s)| *s == NodeState::ActiveOwner)
            .map(|(n, _)| *n)
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

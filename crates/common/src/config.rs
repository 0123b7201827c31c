use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// One reachable cluster node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// Stable node id used by the partition map.
    pub id: NodeId,
    /// Base HTTP address, for example `http://10.0.0.7:8080`.
    pub addr: String,
}

/// Node/engine configuration shared across intake, scheduler, and cluster layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// HTTP bind address, for example `0.0.0.0:8080`.
    pub bind: String,
    /// Total partition count across the cluster (`P`).
    pub partition_max: u32,
    /// Worker threads on this node (`W`); each owns a disjoint partition subset.
    pub worker_count: usize,
    /// Intake worker threads servicing the query queue.
    #[serde(default = "default_query_workers")]
    pub query_workers: usize,
    /// Intake worker threads servicing the other queue.
    #[serde(default = "default_other_workers")]
    pub other_workers: usize,
    /// Hard cap on concurrently executing originator queries.
    #[serde(default = "default_max_running_queries")]
    pub max_running_queries: usize,
    /// Default session gap in milliseconds for tables that do not override it.
    #[serde(default = "default_session_time_ms")]
    pub default_session_time_ms: i64,
    /// Every node in the cluster, including this one.
    #[serde(default)]
    pub nodes: Vec<NodeEndpoint>,
}

fn default_query_workers() -> usize {
    8
}

fn default_other_workers() -> usize {
    32
}

fn default_max_running_queries() -> usize {
    3
}

fn default_session_time_ms() -> i64 {
    30 * 60 * 1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            bind: "0.0.0.0:8080".to_string(),
            partition_max: 32,
            worker_count: 4,
            query_workers: default_query_workers(),
            other_workers: default_other_workers(),
            max_running_queries: default_max_running_queries(),
            default_session_time_ms: default_session_time_ms(),
            nodes: Vec::new(),
        }
    }
}

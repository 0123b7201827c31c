//! Cluster fan-out dispatch.
//!
//! The originator sends the same request to every node owning at least
//! one active partition (itself included) and synchronously collects
//! the replies. Self-dispatch loops through the local intake layer via
//! the node's registered transport so the `fork=true` path is identical
//! for local and remote execution.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use evq_common::{EvqError, NodeId, PartitionId, Result};

use crate::partition_map::{NodeState, PartitionMap};

/// One reply body with its HTTP status. Ownership of the bytes moves to
/// whichever consumer replies with or drops them.
#[derive(Debug, Clone)]
pub struct DataBlock {
    /// Reply body.
    pub data: Vec<u8>,
    /// HTTP status code of the reply.
    pub status: u16,
}

impl DataBlock {
    /// True for a 2xx status.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Collected fan-out replies.
#[derive(Debug, Default)]
pub struct Responses {
    /// One block per dispatched node, in ascending node order.
    pub responses: Vec<DataBlock>,
    /// Set when any node could not be reached or replied unusably.
    pub route_error: bool,
}

/// Outbound request delivery. The server installs an implementation
/// that loops self-dispatch through its own intake queues and sends
/// remote dispatch over HTTP.
pub trait NodeTransport: Send + Sync {
    /// Deliver one request and return the reply block.
    fn send(
        &self,
        node: NodeId,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
    ) -> Result<DataBlock>;
}

/// Partition-map-driven dispatcher.
pub struct Mapper {
    self_node: NodeId,
    partition_map: RwLock<PartitionMap>,
    transport: RwLock<Option<Arc<dyn NodeTransport>>>,
}

impl Mapper {
    /// Build a mapper for this node with an initial partition map.
    pub fn new(self_node: NodeId, partition_map: PartitionMap) -> Self {
        Self {
            self_node,
            partition_map: RwLock::new(partition_map),
            transport: RwLock::new(None),
        }
    }

    /// This node's id.
    pub fn self_node(&self) -> NodeId {
        self.self_node
    }

    /// Install the outbound transport (once intake exists).
    pub fn set_transport(&self, transport: Arc<dyn NodeTransport>) {
        *self.transport.write() = Some(transport);
    }

    /// Snapshot of the partition map.
    pub fn partition_map(&self) -> PartitionMap {
        self.partition_map.read().clone()
    }

    /// Replace the partition map (membership change).
    pub fn set_partition_map(&self, map: PartitionMap) {
        *self.partition_map.write() = map;
    }

    /// Partitions this node actively owns, ascending.
    pub fn local_active_partitions(&self) -> Vec<PartitionId> {
        self.partition_map
            .read()
            .partitions_for_node(self.self_node, &[NodeState::ActiveOwner])
    }

    /// Active owner of the partition holding `actor_hash`.
    pub fn owner_for_partition(&self, partition: PartitionId) -> Option<NodeId> {
        self.partition_map.read().owner(partition)
    }

    fn transport(&self) -> Result<Arc<dyn NodeTransport>> {
        self.transport
            .read()
            .clone()
            .ok_or_else(|| EvqError::internode("no cluster transport installed"))
    }

    /// Send the request to every node owning at least one active
    /// partition, including self, and collect all replies in ascending
    /// node order. Transport failures mark `route_error` and leave an
    /// empty block in place so reply counts stay aligned.
    pub fn dispatch_cluster(
        &self,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
    ) -> Responses {
        let nodes = self.partition_map.read().nodes_with_active_partitions();
        let mut out = Responses::default();
        let transport = match self.transport() {
            Ok(t) => t,
            Err(_) => {
                out.route_error = true;
                return out;
            }
        };
        for node in nodes {
            debug!(node = %node, method, path, "cluster dispatch");
            match transport.send(node, method, path, params, payload) {
                Ok(block) => out.responses.push(block),
                Err(e) => {
                    warn!(node = %node, error = %e, "cluster dispatch failed");
                    out.route_error = true;
                    out.responses.push(DataBlock {
                        data: Vec::new(),
                        status: 0,
                    });
                }
            }
        }
        out
    }

    /// Single-node synchronous dispatch (person routing).
    pub fn dispatch_sync(
        &self,
        node: NodeId,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
    ) -> Result<DataBlock> {
        self.transport()?.send(node, method, path, params, payload)
    }

    /// Single-node asynchronous dispatch (batch fan-out). Returns false
    /// when no transport is installed; otherwise the callback receives
    /// the reply block (status 0 on transport failure) on a detached
    /// thread.
    pub fn dispatch_async(
        self: &Arc<Self>,
        node: NodeId,
        method: &str,
        path: &str,
        params: &[(String, String)],
        payload: &[u8],
        callback: impl FnOnce(DataBlock) + Send + 'static,
    ) -> bool {
        let Ok(transport) = self.transport() else {
            return false;
        };
        let method = method.to_string();
        let path = path.to_string();
        let params = params.to_vec();
        let payload = payload.to_vec();
        std::thread::spawn(move || {
            let block = transport
                .send(node, &method, &path, &params, &payload)
                .unwrap_or(DataBlock {
                    data: Vec::new(),
                    status: 0,
                });
            callback(block);
        });
        true
    }
}

/// Interpretation of one fork reply on the originator, shared by every
/// fork/merge handler.
pub enum ForkReply {
    /// Binary internode payload.
    Binary(Vec<u8>),
    /// Well-formed JSON error body to forward verbatim with 400.
    JsonError(Vec<u8>),
    /// Empty body, non-JSON failure, or transport failure.
    Route,
}

/// Classify a fork reply per the originator rules: binary blobs merge,
/// embedded JSON errors forward verbatim, anything else is a route
/// failure the client must retry.
pub fn classify_fork_reply(block: &DataBlock, is_blob: impl Fn(&[u8]) -> bool) -> ForkReply {
    if block.data.is_empty() {
        return ForkReply::Route;
    }
    if is_blob(&block.data) {
        return ForkReply::Binary(block.data.clone());
    }
    if block.data.first() == Some(&b'{') {
        // only a body with an "error" member is forwardable
        if let Ok(value) = std::str::from_utf8(&block.data) {
            if value.contains("\"error\"") {
                return ForkReply::JsonError(block.data.clone());
            }
        }
    }
    ForkReply::Route
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedTransport {
        replies: Mutex<Vec<Result<DataBlock>>>,
    }

    impl NodeTransport for ScriptedTransport {
        fn send(
            &self,
            _node: NodeId,
            _method: &str,
            _path: &str,
            _params: &[(String, String)],
            _payload: &[u8],
        ) -> Result<DataBlock> {
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn mapper_with(replies: Vec<Result<DataBlock>>, nodes: u64) -> Arc<Mapper> {
        let mut map = PartitionMap::new();
        for n in 0..nodes {
            map.assign(PartitionId(n as u32), NodeId(n + 1), NodeState::ActiveOwner);
        }
        let mapper = Arc::new(Mapper::new(NodeId(1), map));
        mapper.set_transport(Arc::new(ScriptedTransport {
            replies: Mutex::new(replies),
        }));
        mapper
    }

    #[test]
    fn dispatch_collects_one_block_per_node() {
        let mapper = mapper_with(
            vec![
                Ok(DataBlock {
                    data: b"a".to_vec(),
                    status: 200,
                }),
                Ok(DataBlock {
                    data: b"b".to_vec(),
                    status: 200,
                }),
            ],
            2,
        );
        let out = mapper.dispatch_cluster("POST", "/v1/query/t/event", &[], b"");
        assert!(!out.route_error);
        assert_eq!(out.responses.len(), 2);
    }

    #[test]
    fn transport_failure_sets_route_error() {
        let mapper = mapper_with(
            vec![Err(EvqError::internode("connection refused"))],
            1,
        );
        let out = mapper.dispatch_cluster("POST", "/v1/query/t/event", &[], b"");
        assert!(out.route_error);
        assert_eq!(out.responses.len(), 1);
    }

    #[test]
    fn fork_reply_classification() {
        let blob = |b: &[u8]| b.starts_with(b"EVQ1");
        let binary = DataBlock {
            data: b"EVQ1....".to_vec(),
            status: 200,
        };
        let json_err = DataBlock {
            data: br#"{"error":{"class":"query"}}"#.to_vec(),
            status: 400,
        };
        let empty = DataBlock {
            data: Vec::new(),
            status: 200,
        };
        let junk = DataBlock {
            data: b"<html>".to_vec(),
            status: 502,
        };
        assert!(matches!(classify_fork_reply(&binary, blob), ForkReply::Binary(_)));
        assert!(matches!(
            classify_fork_reply(&json_err, blob),
            ForkReply::JsonError(_)
        ));
        assert!(matches!(classify_fork_reply(&empty, blob), ForkReply::Route));
        assert!(matches!(classify_fork_reply(&junk, blob), ForkReply::Route));
    }
}

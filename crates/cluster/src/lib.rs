//! Partition map and cluster fan-out dispatch.
//!
//! Architecture role:
//! - read side of cluster membership: which node owns which partition
//! - originator fan-out: same request to every owning node with
//!   `fork=true`, synchronous collection of all replies
//! - single-node sync/async dispatch for person routing and batch

pub mod mapper;
pub mod partition_map;
pub mod transport;

pub use mapper::{classify_fork_reply, DataBlock, ForkReply, Mapper, NodeTransport, Responses};
pub use partition_map::{NodeState, PartitionMap};
pub use transport::HttpTransport;

//! Shared per-node runtime handed to every RPC handler.

use std::sync::Arc;

use evq_cluster::Mapper;
use evq_common::NodeConfig;
use evq_engine::{AsyncPool, Database, QueryCompiler};

/// Everything a handler needs: catalog, scheduler, cluster dispatch,
/// and the script compiler seam.
pub struct NodeRuntime {
    /// Node configuration.
    pub config: NodeConfig,
    /// Table catalog.
    pub database: Database,
    /// Partition worker pool.
    pub pool: Arc<AsyncPool>,
    /// Cluster fan-out dispatcher.
    pub mapper: Arc<Mapper>,
    /// Script compiler collaborator.
    pub compiler: Arc<dyn QueryCompiler>,
}

impl NodeRuntime {
    /// Assemble the runtime.
    pub fn new(
        config: NodeConfig,
        database: Database,
        pool: Arc<AsyncPool>,
        mapper: Arc<Mapper>,
        compiler: Arc<dyn QueryCompiler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            database,
            pool,
            mapper,
            compiler,
        })
    }
}

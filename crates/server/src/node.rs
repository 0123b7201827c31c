//! Node assembly: wires the pool, mapper, intake, and transport.

use std::sync::Arc;

use evq_cluster::{HttpTransport, Mapper, PartitionMap};
use evq_common::{NodeConfig, Result};
use evq_engine::{AsyncPool, Database, QueryCompiler};

use crate::intake::Intake;
use crate::rpc;
use crate::server::LocalTransport;
use crate::state::NodeRuntime;

/// Start the scheduler and intake pools and wire the cluster transport.
/// The returned intake is handed to the HTTP listener.
pub fn boot(
    config: NodeConfig,
    database: Database,
    compiler: Arc<dyn QueryCompiler>,
    partition_map: PartitionMap,
) -> Result<(Arc<NodeRuntime>, Arc<Intake>)> {
    let pool = AsyncPool::start(config.partition_max, config.worker_count);
    let mapper = Arc::new(Mapper::new(config.node_id, partition_map));

    let runtime = NodeRuntime::new(
        config.clone(),
        database,
        pool,
        Arc::clone(&mapper),
        compiler,
    );

    let dispatch_runtime = Arc::clone(&runtime);
    let intake = Intake::start(
        config.query_workers,
        config.other_workers,
        config.max_running_queries,
        Arc::new(move |message| rpc::dispatch(&dispatch_runtime, message)),
    );

    let http = HttpTransport::new(&config.nodes)?;
    mapper.set_transport(Arc::new(LocalTransport::new(
        config.node_id,
        Arc::clone(&intake),
        http,
    )));

    Ok((runtime, intake))
}

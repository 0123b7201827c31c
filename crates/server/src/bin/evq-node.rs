use std::env;
use std::sync::Arc;

use evq_cluster::PartitionMap;
use evq_common::{NodeConfig, NodeEndpoint, NodeId};
use evq_engine::{ColumnType, Database, Table, TableSchema};
use evq_script::BasicCompiler;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or_default(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

/// `EVQ_NODES` format: `1=http://host:8080,2=http://host2:8080`.
fn parse_nodes(raw: &str) -> Vec<NodeEndpoint> {
    raw.split(',')
        .filter_map(|entry| {
            let (id, addr) = entry.split_once('=')?;
            Some(NodeEndpoint {
                id: NodeId(id.trim().parse().ok()?),
                addr: addr.trim().to_string(),
            })
        })
        .collect()
}

/// `EVQ_TABLES` format: `sales:product=text,price=double,qty=int;web:url=text`.
fn parse_tables(raw: &str, session_time_ms: i64) -> Vec<Table> {
    raw.split(';')
        .filter_map(|entry| {
            let (name, cols) = entry.split_once(':')?;
            let columns: Vec<(String, ColumnType)> = cols
                .split(',')
                .filter_map(|col| {
                    let (cname, kind) = col.split_once('=')?;
                    let kind = match kind.trim() {
                        "int" => ColumnType::Int,
                        "double" => ColumnType::Double,
                        "bool" => ColumnType::Bool,
                        "text" => ColumnType::Text,
                        _ => return None,
                    };
                    Some((cname.trim().to_string(), kind))
                })
                .collect();
            Some(Table::new(
                name.trim(),
                TableSchema::new(columns),
                session_time_ms,
            ))
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let node_id = NodeId(env_u64_or_default("EVQ_NODE_ID", 1));
    let bind = env_or_default("EVQ_BIND", "0.0.0.0:8080");
    let partition_max = env_u64_or_default("EVQ_PARTITIONS", 32) as u32;
    let worker_count = env_usize_or_default("EVQ_WORKERS", 4);
    let nodes = parse_nodes(&env_or_default("EVQ_NODES", ""));

    let config = NodeConfig {
        node_id,
        bind: bind.clone(),
        partition_max,
        worker_count,
        nodes,
        ..NodeConfig::default()
    };

    let database = Database::new();
    for table in parse_tables(
        &env_or_default("EVQ_TABLES", ""),
        config.default_session_time_ms,
    ) {
        database.add(table);
    }

    // single-node map unless a cluster layout is provided; multi-node
    // deployments replace this via the membership collaborator
    let partition_map = PartitionMap::single_node(node_id, partition_max);

    // boot on the plain main thread; the blocking internode client must
    // not be created inside the async listener runtime
    let (_node, intake) = evq_server::boot(
        config,
        database,
        Arc::new(BasicCompiler::new()),
        partition_map,
    )?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(evq_server::serve(&bind, intake))?;
    Ok(())
}

//! End-to-end handler tests driven through the intake queues, including
//! the canonical error scenarios and a full single-node query flow.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use evq_cluster::{DataBlock, NodeState, NodeTransport, PartitionMap};
use evq_common::{hash_actor_id, partition_for, NodeConfig, NodeId, PartitionId, Result};
use evq_engine::{ColumnType, Database, Table, TableSchema};
use evq_result::multi_set_to_internode;
use evq_script::BasicCompiler;
use evq_server::{boot, route_message, Intake, Message, NodeRuntime};

fn test_config() -> NodeConfig {
    NodeConfig {
        node_id: NodeId(1),
        partition_max: 8,
        worker_count: 2,
        query_workers: 2,
        other_workers: 4,
        max_running_queries: 3,
        ..NodeConfig::default()
    }
}

fn sales_schema() -> TableSchema {
    TableSchema::new([
        ("product", ColumnType::Text),
        ("price", ColumnType::Double),
        ("qty", ColumnType::Int),
    ])
}

fn test_node(map: PartitionMap) -> (Arc<NodeRuntime>, Arc<Intake>) {
    let config = test_config();
    let database = Database::new();
    database.add(Table::new(
        "sales",
        sales_schema(),
        config.default_session_time_ms,
    ));
    boot(config, database, Arc::new(BasicCompiler::new()), map).expect("boot node")
}

fn call(
    intake: &Arc<Intake>,
    method: &str,
    path: &str,
    params: &[(&str, &str)],
    body: &str,
) -> (u16, Vec<u8>) {
    let (tx, rx) = mpsc::sync_channel::<(u16, Vec<u8>)>(1);
    let message = Message::new(
        method,
        path,
        params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body.as_bytes().to_vec(),
        Box::new(move |status, body| {
            let _ = tx.send((status, body));
        }),
    );
    route_message(intake, message);
    rx.recv_timeout(Duration::from_secs(30)).expect("handler reply")
}

fn json_of(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("json body")
}

fn assert_error(body: &[u8], class: &str, code: &str, message_contains: &str) {
    let json = json_of(body);
    assert_eq!(json["error"]["class"], class, "body: {json}");
    assert_eq!(json["error"]["code"], code, "body: {json}");
    assert!(
        json["error"]["message"]
            .as_str()
            .unwrap_or_default()
            .contains(message_contains),
        "body: {json}"
    );
}

#[test]
fn empty_cluster_event_query_returns_empty_result() {
    let (_runtime, intake) = test_node(PartitionMap::new());
    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[],
        "aggregate: count\n",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    assert_eq!(json_of(&body), serde_json::json!({ "_": [] }));
    intake.shutdown();
}

#[test]
fn histogram_rejects_tally_scripts_before_fanout() {
    let (_runtime, intake) = test_node(PartitionMap::new());
    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/histogram/spend",
        &[],
        "aggregate: count\n",
    );
    assert_eq!(status, 400);
    assert_error(
        &body,
        "parse",
        "syntax_error",
        "histogram queries should not call 'tally'",
    );
    intake.shutdown();
}

#[test]
fn column_between_requires_and_param() {
    let (_runtime, intake) = test_node(PartitionMap::new());
    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/column/price",
        &[("between", "10")],
        "",
    );
    assert_eq!(status, 400);
    assert_error(
        &body,
        "query",
        "syntax_error",
        "column query using 'between' requires an 'and' param",
    );
    intake.shutdown();
}

#[test]
fn column_rejects_bad_regex() {
    let (_runtime, intake) = test_node(PartitionMap::new());
    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/column/product",
        &[("rx", "[abc")],
        "",
    );
    assert_eq!(status, 400);
    assert_error(
        &body,
        "query",
        "syntax_error",
        "could not compile regular express: [abc",
    );
    intake.shutdown();
}

#[test]
fn event_rejects_unknown_sort_alias() {
    let (_runtime, intake) = test_node(PartitionMap::new());
    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[("sort", "frobnitz")],
        "aggregate: count\n",
    );
    assert_eq!(status, 400);
    assert_error(
        &body,
        "parse",
        "syntax_error",
        "sort column not found in query aggregates",
    );
    intake.shutdown();
}

/// Per-node scripted replies keyed by node id.
struct ScriptedTransport {
    replies: Vec<(NodeId, DataBlock)>,
}

impl NodeTransport for ScriptedTransport {
    fn send(
        &self,
        node: NodeId,
        _method: &str,
        _path: &str,
        _params: &[(String, String)],
        _payload: &[u8],
    ) -> Result<DataBlock> {
        Ok(self
            .replies
            .iter()
            .find(|(n, _)| *n == node)
            .map(|(_, block)| block.clone())
            .expect("scripted node"))
    }
}

#[test]
fn empty_fork_body_becomes_route_error() {
    let mut map = PartitionMap::new();
    map.assign(PartitionId(0), NodeId(1), NodeState::ActiveOwner);
    map.assign(PartitionId(1), NodeId(2), NodeState::ActiveOwner);
    let (runtime, intake) = test_node(map);

    let healthy = multi_set_to_internode(&[]).expect("empty blob");
    runtime.mapper.set_transport(Arc::new(ScriptedTransport {
        replies: vec![
            (
                NodeId(1),
                DataBlock {
                    data: healthy,
                    status: 200,
                },
            ),
            (
                NodeId(2),
                DataBlock {
                    data: Vec::new(),
                    status: 200,
                },
            ),
        ],
    }));

    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[],
        "aggregate: count\n",
    );
    assert_eq!(status, 400);
    assert_error(
        &body,
        "config",
        "route_error",
        "potential node failure - please re-issue the request",
    );
    intake.shutdown();
}

#[test]
fn person_requests_route_to_the_owning_node() {
    // every partition owned by node 2; node 1 must relay verbatim
    let mut map = PartitionMap::new();
    for p in 0..8 {
        map.assign(PartitionId(p), NodeId(2), NodeState::ActiveOwner);
    }
    let (runtime, intake) = test_node(map);
    runtime.mapper.set_transport(Arc::new(ScriptedTransport {
        replies: vec![(
            NodeId(2),
            DataBlock {
                data: br#"{"id_string":"alice"}"#.to_vec(),
                status: 200,
            },
        )],
    }));

    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/person",
        &[("sid", "alice")],
        "",
    );
    assert_eq!(status, 200);
    assert_eq!(json_of(&body)["id_string"], "alice");
    intake.shutdown();
}

#[test]
fn segment_flags_register_in_the_table() {
    let (runtime, intake) = test_node(PartitionMap::new());
    let (status, _body) = call(
        &intake,
        "POST",
        "/v1/query/sales/segment",
        &[],
        "@segment s ttl=60000 refresh=30000\nprice gte 100\n",
    );
    assert_eq!(status, 200);

    let table = runtime.database.get("sales").expect("table");
    let def = table.segment("s").expect("segment registered");
    assert_eq!(def.ttl_ms, 60_000);
    assert_eq!(def.refresh_ms, 30_000);
    assert!(def.macros.is_segment);
    assert_eq!(def.macros.segment_ttl_ms, Some(60_000));
    assert_eq!(def.macros.segment_refresh_ms, Some(30_000));
    intake.shutdown();
}

fn insert_fixture(intake: &Arc<Intake>) {
    let rows = serde_json::json!([
        { "id_string": "alice", "stamp": 1000,
          "values": { "product": "widget", "price": 9.99, "qty": 1 } },
        { "id_string": "alice", "stamp": 2000,
          "values": { "product": "widget", "price": 9.99, "qty": 1 } },
        { "id_string": "bob", "stamp": 5000,
          "values": { "product": "gadget", "price": 25.0, "qty": 2 } },
    ]);
    let (status, body) = call(intake, "POST", "/v1/insert/sales", &[], &rows.to_string());
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    assert_eq!(json_of(&body)["inserted"], 3);
}

#[test]
fn single_node_event_query_counts_every_partition_once() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[],
        "aggregate: count, people\ngroup: product\n",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let json = json_of(&body);
    let rows = json["_"].as_array().expect("rows");
    assert_eq!(rows.len(), 2);
    // default ordering: first declared column, descending
    assert_eq!(rows[0]["g"], "widget");
    assert_eq!(rows[0]["c"][0], 2);
    assert_eq!(rows[0]["c"][1], 1);
    assert_eq!(rows[1]["g"], "gadget");
    assert_eq!(rows[1]["c"][0], 1);

    // the same query twice yields identical JSON
    let (_, again) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[],
        "aggregate: count, people\ngroup: product\n",
    );
    assert_eq!(json, json_of(&again));
    intake.shutdown();
}

#[test]
fn single_node_column_distribution_counts_actors() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/column/product",
        &[("order", "asc")],
        "",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let json = json_of(&body);
    let rows = json["_"].as_array().expect("rows");
    let mut seen: Vec<(String, i64)> = rows
        .iter()
        .map(|r| {
            (
                r["g"].as_str().unwrap_or_default().to_string(),
                r["c"][0].as_i64().unwrap_or_default(),
            )
        })
        .collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![("gadget".to_string(), 1), ("widget".to_string(), 1)]
    );
    intake.shutdown();
}

#[test]
fn single_node_histogram_fills_forced_range() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/histogram/spend",
        &[("bucket", "10"), ("min", "0"), ("order", "asc")],
        "return sum price\n",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let json = json_of(&body);
    let rows = json["_"].as_array().expect("rows");
    // alice sums to 19.98 (bucket 10), bob to 25.0 (bucket 20); the
    // forced min backfills the empty zero bucket. Keys stay in scaled
    // fixed-point units.
    let pairs: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| {
            (
                r["g"].as_i64().unwrap_or_default(),
                r["c"][0].as_i64().unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(pairs, vec![(0, 0), (100_000, 1), (200_000, 1)]);
    intake.shutdown();
}

#[test]
fn segments_restrict_event_queries() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let (status, _) = call(
        &intake,
        "POST",
        "/v1/query/sales/segment",
        &[],
        "@segment big\nprice gte 20\n",
    );
    assert_eq!(status, 200);

    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[("segments", "big")],
        "aggregate: count\ngroup: product\n",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let rows_json = json_of(&body);
    let rows = rows_json["_"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["g"], "gadget");
    assert_eq!(rows[0]["c"][0], 1);
    intake.shutdown();
}

#[test]
fn person_lookup_on_owning_node_dumps_the_grid() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/person",
        &[("sid", "alice")],
        "",
    );
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let json = json_of(&body);
    assert_eq!(json["id_string"], "alice");
    assert_eq!(json["event_count"], 2);
    assert_eq!(json["events"][0]["values"]["product"], "widget");

    // actors hash the same way the router shards them
    let hash = hash_actor_id("alice");
    assert!(partition_for(hash, 8) < 8);

    let (status, body) = call(
        &intake,
        "GET",
        "/v1/query/sales/person",
        &[("sid", "nobody")],
        "",
    );
    assert_eq!(status, 400);
    assert_error(&body, "query", "general_error", "person could not be found");
    intake.shutdown();
}

#[test]
fn batch_runs_segments_before_queries_and_keeps_order() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    insert_fixture(&intake);

    let script = "\
@segment big ttl=5000
    price gte 20
@use big
@histogram spend bucket=10
    return sum price
";
    let (status, body) = call(&intake, "POST", "/v1/query/sales/batch", &[], script);
    assert_eq!(status, 200, "body: {}", String::from_utf8_lossy(&body));
    let json = json_of(&body);
    let items = json["_"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    // only bob is in the segment; his spend lands in the 20.0 bucket
    let rows = items[0]["_"].as_array().expect("inner rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["g"], 200_000);
    assert_eq!(rows[0]["c"][0], 1);
    intake.shutdown();
}

#[test]
fn debug_returns_the_compiled_dump() {
    let (_runtime, intake) = test_node(PartitionMap::single_node(NodeId(1), 8));
    let (status, body) = call(
        &intake,
        "POST",
        "/v1/query/sales/event",
        &[("debug", "true")],
        "aggregate: count\n",
    );
    assert_eq!(status, 200);
    assert!(String::from_utf8_lossy(&body).contains("aggregate: count"));
    intake.shutdown();
}

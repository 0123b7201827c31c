//! Cell roles exercised against an in-memory grid, driven directly
//! through the `OpenLoop` contract (no worker threads).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use evq_common::{hash_actor_id, hash_bytes, scale_double, EvqError, PartitionId, WorkerId};
use evq_engine::{
    ActorProgram, ActorView, CellContext, CellResponse, CellState, ColumnQueryConfig,
    ColumnQueryMode, ColumnType, CompiledQuery, Event, OpenLoop, OpenLoopColumn,
    OpenLoopHistogram, OpenLoopPerson, OpenLoopQuery, OpenLoopSegment, Shuttle, Table,
    TableSchema, TallySink,
};
use evq_result::{ColumnDescriptor, ColumnKind, Reducer, ResultSet, RowKey};

const PRODUCT: usize = 0;
const PRICE: usize = 1;

fn schema() -> TableSchema {
    TableSchema::new([("product", ColumnType::Text), ("price", ColumnType::Double)])
}

fn seeded_table() -> Arc<Table> {
    let table = Arc::new(Table::new("sales", schema(), 30 * 60 * 1000));
    let parts = table.partition_or_create(PartitionId(0));
    let mut guard = parts.lock();
    let widget = guard.intern("widget");
    let gadget = guard.intern("gadget");

    let alice = guard.upsert_actor(hash_actor_id("alice"), Some("alice"));
    guard.insert_event(
        alice,
        Event {
            stamp: 1_000,
            values: vec![(PRODUCT, widget), (PRICE, scale_double(9.99))],
        },
    );
    guard.insert_event(
        alice,
        Event {
            stamp: 2_000,
            values: vec![(PRODUCT, widget), (PRICE, scale_double(9.99))],
        },
    );

    let bob = guard.upsert_actor(hash_actor_id("bob"), Some("bob"));
    guard.insert_event(
        bob,
        Event {
            stamp: 5_000,
            values: vec![(PRODUCT, gadget), (PRICE, scale_double(25.0))],
        },
    );
    drop(guard);
    table
}

/// Tallies event count per product.
struct CountPerProduct;

impl ActorProgram for CountPerProduct {
    fn exec(
        &self,
        view: &ActorView<'_>,
        sink: &mut dyn TallySink,
    ) -> Result<(), EvqError> {
        for event in &view.actor.events {
            let Some(product) = event.value(PRODUCT) else { continue };
            if let Some(text) = view.partition.literal(product) {
                sink.intern(product, text);
            }
            sink.tally(&RowKey::single(product), 0, 1);
        }
        Ok(())
    }

    fn exec_scalar(&self, view: &ActorView<'_>) -> Result<Option<i64>, EvqError> {
        let sum: i64 = view
            .actor
            .events
            .iter()
            .filter_map(|e| e.value(PRICE))
            .sum();
        Ok(Some(sum))
    }

    fn exec_predicate(&self, view: &ActorView<'_>) -> Result<bool, EvqError> {
        Ok(view
            .actor
            .events
            .iter()
            .any(|e| e.value(PRICE).unwrap_or(0) >= scale_double(20.0)))
    }
}

fn compiled(segments: Vec<String>) -> CompiledQuery {
    CompiledQuery {
        columns: vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum)],
        index_count: 1,
        segments,
        session_time_ms: 30 * 60 * 1000,
        is_segment: false,
        segment_ttl_ms: None,
        segment_refresh_ms: None,
        on_insert: false,
        marshals: Default::default(),
        literals: Default::default(),
        program: Arc::new(CountPerProduct),
        dump: String::new(),
    }
}

fn drive(cell: &mut dyn OpenLoop) {
    let ctx = CellContext {
        partition: PartitionId(0),
        worker: WorkerId(0),
        now: evq_common::now_ms(),
    };
    cell.prepare(&ctx);
    let mut guard = 0;
    while cell.state() == CellState::Running {
        cell.run(&ctx);
        guard += 1;
        assert!(guard < 10_000, "cell failed to terminate");
    }
}

fn ok_shuttle() -> (Arc<Shuttle<()>>, Arc<AtomicUsize>, Arc<Mutex<Option<EvqError>>>) {
    let fired = Arc::new(AtomicUsize::new(0));
    let error = Arc::new(Mutex::new(None));
    let (fired_in, error_in) = (Arc::clone(&fired), Arc::clone(&error));
    let shuttle = Arc::new(Shuttle::new(1, move |responses: Vec<CellResponse<()>>| {
        fired_in.fetch_add(1, Ordering::SeqCst);
        *error_in.lock() = responses.into_iter().find_map(|r| r.error);
    }));
    (shuttle, fired, error)
}

#[test]
fn query_cell_tallies_per_group() {
    let table = seeded_table();
    let result = Arc::new(Mutex::new(ResultSet::new(
        compiled(vec![]).columns.clone(),
        1,
    )));
    let (shuttle, fired, error) = ok_shuttle();
    let mut cell = OpenLoopQuery::new(
        shuttle,
        Arc::clone(&table),
        compiled(vec![]),
        Arc::clone(&result),
        1,
    );
    drive(&mut cell);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(error.lock().is_none());
    let result = result.lock();
    let widget = hash_bytes(b"widget");
    let gadget = hash_bytes(b"gadget");
    let rows: Vec<(i64, Option<i64>)> = result.rows().map(|(k, c)| (k.0[0], c[0])).collect();
    assert!(rows.contains(&(widget, Some(2))));
    assert!(rows.contains(&(gadget, Some(1))));
    assert_eq!(result.literals()[&widget], "widget");
}

#[test]
fn query_cell_reports_missing_segment() {
    let table = seeded_table();
    let result = Arc::new(Mutex::new(ResultSet::new(
        compiled(vec![]).columns.clone(),
        1,
    )));
    let (shuttle, fired, error) = ok_shuttle();
    let mut cell = OpenLoopQuery::new(
        shuttle,
        table,
        compiled(vec!["whales".to_string()]),
        result,
        1,
    );
    drive(&mut cell);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let error = error.lock().clone().expect("missing segment error");
    assert_eq!(error.message, "missing segment 'whales'");
}

#[test]
fn segment_cell_commits_bits_and_counts_members() {
    let table = seeded_table();
    let result = Arc::new(Mutex::new(ResultSet::new(
        vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum)],
        1,
    )));
    let (shuttle, fired, error) = ok_shuttle();
    let mut cell = OpenLoopSegment::new(
        shuttle,
        Arc::clone(&table),
        vec![("big_spender".to_string(), compiled(vec![]))],
        Arc::clone(&result),
        1,
    );
    drive(&mut cell);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(error.lock().is_none());
    let parts = table.partition(PartitionId(0)).expect("partition exists");
    let parts = parts.lock();
    let bits = parts.segment("big_spender").expect("segment committed");
    assert_eq!(bits.population(), 1); // only bob crosses the threshold

    let result = result.lock();
    let key = hash_bytes(b"big_spender");
    let (_, cells) = result.rows().find(|(k, _)| k.0[0] == key).expect("count row");
    assert_eq!(cells[0], Some(1));
}

#[test]
fn query_cell_respects_segment_membership() {
    let table = seeded_table();
    // materialise the segment first
    {
        let result = Arc::new(Mutex::new(ResultSet::new(
            vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum)],
            1,
        )));
        let (shuttle, _, _) = ok_shuttle();
        let mut cell = OpenLoopSegment::new(
            shuttle,
            Arc::clone(&table),
            vec![("big_spender".to_string(), compiled(vec![]))],
            result,
            1,
        );
        drive(&mut cell);
    }

    let result = Arc::new(Mutex::new(ResultSet::new(
        compiled(vec![]).columns.clone(),
        1,
    )));
    let (shuttle, _, error) = ok_shuttle();
    let mut cell = OpenLoopQuery::new(
        shuttle,
        table,
        compiled(vec!["big_spender".to_string()]),
        Arc::clone(&result),
        1,
    );
    drive(&mut cell);

    assert!(error.lock().is_none());
    let result = result.lock();
    let gadget = hash_bytes(b"gadget");
    let widget = hash_bytes(b"widget");
    let rows: Vec<(i64, Option<i64>)> = result.rows().map(|(k, c)| (k.0[0], c[0])).collect();
    assert!(rows.contains(&(gadget, Some(1))));
    assert!(!rows.iter().any(|(k, _)| *k == widget));
}

#[test]
fn column_cell_buckets_and_filters() {
    let table = seeded_table();
    let price = table.schema().column("price").cloned().expect("price column");
    let result = Arc::new(Mutex::new(ResultSet::new(
        vec![ColumnDescriptor::new("price", ColumnKind::Int, Reducer::Sum)],
        1,
    )));
    let (shuttle, fired, error) = ok_shuttle();
    let config = ColumnQueryConfig {
        column: price,
        mode: ColumnQueryMode::Between,
        low: scale_double(5.0),
        high: scale_double(30.0),
        needle: None,
        rx: None,
        bucket: scale_double(10.0),
        segments: vec![],
    };
    let mut cell = OpenLoopColumn::new(shuttle, table, config, Arc::clone(&result), 1);
    drive(&mut cell);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(error.lock().is_none());
    let result = result.lock();
    // 9.99 falls in the [0,10) bucket, 25.0 in [20,30)
    let rows: Vec<(i64, Option<i64>)> = result.rows().map(|(k, c)| (k.0[0], c[0])).collect();
    assert!(rows.contains(&(0, Some(1))));
    assert!(rows.contains(&(scale_double(20.0), Some(1))));
}

#[test]
fn histogram_cell_bins_scalar_returns() {
    let table = seeded_table();
    let result = Arc::new(Mutex::new(ResultSet::new(
        vec![ColumnDescriptor::new("spend", ColumnKind::Int, Reducer::Sum)],
        1,
    )));
    let (shuttle, _, error) = ok_shuttle();
    let bucket = scale_double(10.0);
    let mut cell = OpenLoopHistogram::new(
        shuttle,
        table,
        compiled(vec![]),
        bucket,
        Arc::clone(&result),
        1,
    );
    drive(&mut cell);

    assert!(error.lock().is_none());
    let result = result.lock();
    // alice returns 19.98 -> bucket 10.0; bob returns 25.0 -> bucket 20.0
    let rows: Vec<(i64, Option<i64>)> = result.rows().map(|(k, c)| (k.0[0], c[0])).collect();
    assert!(rows.contains(&(scale_double(10.0), Some(1))));
    assert!(rows.contains(&(scale_double(20.0), Some(1))));
}

#[test]
fn person_cell_dumps_one_actor() {
    let table = seeded_table();
    let fired = Arc::new(AtomicUsize::new(0));
    let body = Arc::new(Mutex::new(serde_json::Value::Null));
    let (fired_in, body_in) = (Arc::clone(&fired), Arc::clone(&body));
    let shuttle = Arc::new(Shuttle::new(
        1,
        move |mut responses: Vec<CellResponse<serde_json::Value>>| {
            fired_in.fetch_add(1, Ordering::SeqCst);
            if let Some(value) = responses.pop().and_then(|r| r.data) {
                *body_in.lock() = value;
            }
        },
    ));
    let mut cell = OpenLoopPerson::new(shuttle, table, hash_actor_id("alice"));
    drive(&mut cell);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    let body = body.lock();
    assert_eq!(body["id_string"], "alice");
    assert_eq!(body["event_count"], 2);
    assert_eq!(body["events"][0]["values"]["product"], "widget");
    assert_eq!(body["events"][0]["values"]["price"], 9.99);
}

#[test]
fn partition_removed_mid_scan_replies_once() {
    let table = seeded_table();
    let result = Arc::new(Mutex::new(ResultSet::new(
        compiled(vec![]).columns.clone(),
        1,
    )));
    let (shuttle, fired, error) = ok_shuttle();
    let mut cell = OpenLoopQuery::new(shuttle, table, compiled(vec![]), result, 1);
    let ctx = CellContext {
        partition: PartitionId(0),
        worker: WorkerId(0),
        now: evq_common::now_ms(),
    };
    cell.prepare(&ctx);
    cell.partition_removed();
    assert_eq!(cell.state(), CellState::Done);
    // a late second cancellation must not double-arrive
    cell.partition_removed();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(error.lock().is_some());
}

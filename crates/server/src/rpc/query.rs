//! Query RPC handlers: event, segment, column, histogram, person, batch.
//!
//! Every handler follows the same shape: validate, compile, then either
//! originate (fan the same request out to every node with `fork=true`
//! and merge the binary replies) or execute the fork locally (one cell
//! per active partition, per-worker result buffers, one shuttle).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use tracing::info;

use evq_cluster::{classify_fork_reply, DataBlock, ForkReply};
use evq_common::{
    global_metrics, hash_actor_id, partition_for, scale_double, EvqError, PartitionId,
};
use evq_engine::{
    CellResponse, ColumnQueryConfig, ColumnQueryMode, CompiledQuery, Marshal, OpenLoop,
    OpenLoopColumn, OpenLoopHistogram, OpenLoopPerson, OpenLoopQuery, OpenLoopSegment, SegmentDef,
    Shuttle, Table,
};
use evq_result::{
    histogram_fill, internode_to_set, is_internode_blob, merge_macro_literals,
    merge_sets_to_json, multi_set_to_internode, sort_by_column, sort_by_key, trim,
    ColumnDescriptor, ColumnKind, Reducer, ResultSet, SortOrder, USE_OBSERVED,
};
use evq_script::{extract_sections, SectionDefinition};

use crate::message::MessagePtr;
use crate::rpc::{inline_params, resolve_sort, segments_param, sort_order, SortMode};
use crate::state::NodeRuntime;

/// Maximum concurrent inner dispatches in a batch request.
const BATCH_RUN_MAX: usize = 4;

/// Inner-dispatch reply wait bound for batch fan-out.
const BATCH_REPLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Originator merge parameters.
struct ForkMergeSpec {
    sort: SortMode,
    order: SortOrder,
    trim: i64,
    bucket: i64,
    force_min: i64,
    force_max: i64,
}

impl ForkMergeSpec {
    fn plain(sort: SortMode, order: SortOrder, trim: i64) -> Self {
        Self {
            sort,
            order,
            trim,
            bucket: 0,
            force_min: USE_OBSERVED,
            force_max: USE_OBSERVED,
        }
    }
}

/// The fork fan-out. Adds `fork=true`, dispatches the identical request
/// to every owning node (self included), decodes each binary reply, and
/// merges/sorts/trims into the client JSON. Replies on error and
/// returns `None`; the caller replies 200 with `Some` JSON.
fn fork_query(
    runtime: &Arc<NodeRuntime>,
    message: &MessagePtr,
    kind: &str,
    spec: &ForkMergeSpec,
) -> Option<serde_json::Value> {
    let started = Instant::now();
    let mut params: Vec<(String, String)> = message
        .params()
        .iter()
        .filter(|(k, _)| k != "fork")
        .cloned()
        .collect();
    params.push(("fork".to_string(), "true".to_string()));
    global_metrics().inc_fork_dispatch(kind);

    let result = runtime
        .mapper
        .dispatch_cluster(message.method(), message.path(), &params, message.body());

    let mut sets: Vec<ResultSet> = Vec::with_capacity(result.responses.len());
    let mut route_error = result.route_error;
    for block in &result.responses {
        match classify_fork_reply(block, is_internode_blob) {
            ForkReply::Binary(bytes) => match internode_to_set(&bytes) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    message.reply_error(e);
                    return None;
                }
            },
            ForkReply::JsonError(body) => {
                // an error percolated up from a fork: forward it verbatim
                message.reply(400, body);
                return None;
            }
            ForkReply::Route => route_error = true,
        }
    }

    if route_error {
        message.reply_error(EvqError::route());
        return None;
    }

    let mut json = merge_sets_to_json(&sets);
    if spec.bucket > 0 {
        histogram_fill(&mut json, spec.bucket, spec.force_min, spec.force_max);
    }
    match spec.sort {
        SortMode::Key => sort_by_key(&mut json, spec.order),
        SortMode::Column(at) => sort_by_column(&mut json, spec.order, at),
    }
    trim(&mut json, spec.trim);

    global_metrics().observe_query_seconds(kind, started.elapsed().as_secs_f64());
    Some(json)
}

/// The fork execution path shared by event/segment/column/histogram:
/// allocate one result buffer per worker, one cell per active partition,
/// and a shuttle whose completion merges the buffers into one binary
/// internode reply. An empty active list short-circuits to an empty,
/// valid blob, not an error.
fn fork_execute(
    runtime: &Arc<NodeRuntime>,
    message: &MessagePtr,
    table: &Arc<Table>,
    columns: Vec<ColumnDescriptor>,
    set_count: usize,
    literals: HashMap<i64, String>,
    mut make_cell: impl FnMut(Arc<Shuttle<()>>, Arc<Mutex<ResultSet>>, usize) -> Box<dyn OpenLoop>,
) {
    let active = runtime.mapper.local_active_partitions();
    let result_sets: Vec<Arc<Mutex<ResultSet>>> = (0..runtime.pool.worker_count())
        .map(|_| Arc::new(Mutex::new(ResultSet::new(columns.clone(), set_count))))
        .collect();

    let encode_and_reply = {
        let result_sets = result_sets.clone();
        move |message: &MessagePtr, literals: &HashMap<i64, String>| {
            let mut sets: Vec<ResultSet> = result_sets.iter().map(|s| s.lock().clone()).collect();
            merge_macro_literals(literals, &mut sets);
            match multi_set_to_internode(&sets) {
                Ok(blob) => message.reply(200, blob),
                Err(e) => message.reply_error(e),
            }
        }
    };

    if active.is_empty() {
        // nothing active here: reply with an empty, valid result set
        encode_and_reply(message, &literals);
        return;
    }

    let message_cb = Arc::clone(message);
    let table_name = table.name().to_string();
    let shuttle = Arc::new(Shuttle::new(
        active.len(),
        move |responses: Vec<CellResponse<()>>| {
            for r in &responses {
                if let Some(error) = &r.error {
                    message_cb.reply_error(error.clone());
                    return;
                }
            }
            encode_and_reply(&message_cb, &literals);
            info!(table = %table_name, "fork merge complete");
        },
    ));

    let mut instance = 0_usize;
    runtime.pool.cell_factory(&active, |l| {
        instance += 1;
        make_cell(
            Arc::clone(&shuttle),
            Arc::clone(&result_sets[l.worker_id().0]),
            instance,
        )
    });
}

fn compile_for(
    runtime: &Arc<NodeRuntime>,
    message: &MessagePtr,
    table: &Arc<Table>,
) -> Result<CompiledQuery, EvqError> {
    let params = inline_params(message);
    runtime
        .compiler
        .compile(&message.body_text(), &table.schema(), &params)
}

fn require_body(message: &MessagePtr) -> Result<(), EvqError> {
    if message.body().is_empty() {
        return Err(EvqError::query("missing query code (POST query as text)"));
    }
    Ok(())
}

/// `POST /v1/query/{table}/event`
pub fn event(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str) {
    global_metrics().inc_query("event", table_name);
    let is_fork = message.param_bool("fork");
    info!(table = table_name, fork = is_fork, "inbound events query");

    if let Err(e) = require_body(message) {
        message.reply_error(e);
        return;
    }
    let table = match runtime.database.get_or_err(table_name) {
        Ok(t) => t,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    let session_time = message.param_i64("session_time", table.session_time_ms());
    let mut macros = match compile_for(runtime, message, &table) {
        Ok(m) => m,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };
    match segments_param(message) {
        Ok(Some(segments)) => macros.segments = segments,
        Ok(None) => {}
        Err(e) => {
            message.reply_error(e);
            return;
        }
    }
    macros.session_time_ms = session_time;

    if message.param_bool("debug") {
        message.reply(200, macros.dump.clone().into_bytes());
        return;
    }

    let sort = match resolve_sort(message, &macros.columns) {
        Ok(s) => s,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    if !is_fork {
        let spec = ForkMergeSpec::plain(sort, sort_order(message), message.param_i64("trim", -1));
        if let Some(json) = fork_query(runtime, message, "event", &spec) {
            message.reply_json(200, &json);
        }
        return;
    }

    let columns = macros.columns.clone();
    let set_count = macros.set_count();
    let literals = macros.literals.clone();
    fork_execute(
        runtime,
        message,
        &table,
        columns,
        set_count,
        literals,
        |shuttle, slot, instance| {
            Box::new(OpenLoopQuery::new(
                shuttle,
                Arc::clone(&table),
                macros.clone(),
                slot,
                instance,
            ))
        },
    );
}

/// `POST /v1/query/{table}/segment`
pub fn segment(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str) {
    global_metrics().inc_query("segment", table_name);
    let is_fork = message.param_bool("fork");
    info!(table = table_name, fork = is_fork, "inbound counts query");

    if let Err(e) = require_body(message) {
        message.reply_error(e);
        return;
    }
    let table = match runtime.database.get_or_err(table_name) {
        Ok(t) => t,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    let params = inline_params(message);
    let mut queries: Vec<(String, CompiledQuery)> = Vec::new();
    for section in extract_sections(&message.body_text()) {
        if section.section_type != "segment" {
            continue;
        }
        let mut macros = match runtime
            .compiler
            .compile(&section.code, &table.schema(), &params)
        {
            Ok(m) => m,
            Err(e) => {
                message.reply_error(e);
                return;
            }
        };
        macros.is_segment = true;
        macros.segment_ttl_ms = section.flag_i64("ttl");
        macros.segment_refresh_ms = section.flag_i64("refresh");
        macros.on_insert = section.has_flag("on_insert");
        table.register_segment(SegmentDef {
            name: section.section_name.clone(),
            macros: macros.clone(),
            ttl_ms: macros.segment_ttl_ms.unwrap_or(0),
            refresh_ms: macros.segment_refresh_ms.unwrap_or(0),
            on_insert: macros.on_insert,
            last_modified: evq_common::now_ms(),
        });
        queries.push((section.section_name, macros));
    }

    if queries.is_empty() {
        message.reply_error(EvqError::query_syntax("no @segment sections could be found"));
        return;
    }

    if message.param_bool("debug") {
        let mut out = String::new();
        for (name, macros) in &queries {
            out.push_str(&format!("Script: {name}\n"));
            out.push_str(&macros.dump);
            out.push('\n');
        }
        message.reply(200, out.into_bytes());
        return;
    }

    if !is_fork {
        let spec = ForkMergeSpec::plain(SortMode::Column(0), sort_order(message), -1);
        if let Some(json) = fork_query(runtime, message, "segment", &spec) {
            message.reply_json(200, &json);
        }
        return;
    }

    let columns = queries[0].1.columns.clone();
    fork_execute(
        runtime,
        message,
        &table,
        columns,
        1,
        HashMap::new(),
        |shuttle, slot, instance| {
            Box::new(OpenLoopSegment::new(
                shuttle,
                Arc::clone(&table),
                queries.clone(),
                slot,
                instance,
            ))
        },
    );
}

fn numeric_param(value: &str) -> Result<f64, EvqError> {
    value
        .parse::<f64>()
        .map_err(|_| EvqError::query_syntax(format!("invalid numeric filter value '{value}'")))
}

fn column_filter(
    message: &MessagePtr,
) -> Result<(ColumnQueryMode, String, String, Option<Regex>), EvqError> {
    let modes: [(&str, ColumnQueryMode); 7] = [
        ("gt", ColumnQueryMode::Gt),
        ("gte", ColumnQueryMode::Gte),
        ("lt", ColumnQueryMode::Lt),
        ("lte", ColumnQueryMode::Lte),
        ("eq", ColumnQueryMode::Eq),
        ("between", ColumnQueryMode::Between),
        ("sub", ColumnQueryMode::Sub),
    ];
    for (name, mode) in modes {
        if message.is_param(name) {
            let low = message.param_str(name, "");
            if low.is_empty() {
                return Err(EvqError::query_syntax("column filter requires a value"));
            }
            let high = if mode == ColumnQueryMode::Between {
                let high = message.param_str("and", "");
                if high.is_empty() {
                    return Err(EvqError::query_syntax(
                        "column query using 'between' requires an 'and' param",
                    ));
                }
                high
            } else {
                String::new()
            };
            return Ok((mode, low, high, None));
        }
    }
    if message.is_param("rx") {
        let pattern = message.param_str("rx", "");
        let rx = Regex::new(&pattern).map_err(|_| {
            EvqError::query_syntax(format!("could not compile regular express: {pattern}"))
        })?;
        return Ok((ColumnQueryMode::Rx, pattern, String::new(), Some(rx)));
    }
    Ok((ColumnQueryMode::All, String::new(), String::new(), None))
}

/// `GET|POST /v1/query/{table}/column/{name}`
pub fn column(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str, name: &str) {
    global_metrics().inc_query("column", table_name);
    let is_fork = message.param_bool("fork");

    let table = match runtime.database.get(table_name) {
        Some(t) => t,
        None => {
            message.reply_error(EvqError::config("table not found"));
            return;
        }
    };
    let Some(column) = table.schema().column(name).cloned() else {
        message.reply_error(EvqError::config("column not found"));
        return;
    };

    let (mode, low_raw, high_raw, rx) = match column_filter(message) {
        Ok(f) => f,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };
    let segments = match segments_param(message) {
        Ok(s) => s.unwrap_or_default(),
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    // force typing by column type; doubles scale to fixed-point
    use evq_engine::ColumnType;
    let mut needle = None;
    let (low, high, bucket) = match column.kind {
        ColumnType::Int => {
            let parse = |raw: &str| -> Result<i64, EvqError> {
                if raw.is_empty() {
                    Ok(0)
                } else {
                    Ok(numeric_param(raw)?.round() as i64)
                }
            };
            let low = match parse(&low_raw) {
                Ok(v) => v,
                Err(e) => {
                    message.reply_error(e);
                    return;
                }
            };
            let high = match parse(&high_raw) {
                Ok(v) => v,
                Err(e) => {
                    message.reply_error(e);
                    return;
                }
            };
            (low, high, message.param_f64("bucket", 0.0).round() as i64)
        }
        ColumnType::Double => {
            let parse = |raw: &str| -> Result<i64, EvqError> {
                if raw.is_empty() {
                    Ok(0)
                } else {
                    Ok(scale_double(numeric_param(raw)?))
                }
            };
            let low = match parse(&low_raw) {
                Ok(v) => v,
                Err(e) => {
                    message.reply_error(e);
                    return;
                }
            };
            let high = match parse(&high_raw) {
                Ok(v) => v,
                Err(e) => {
                    message.reply_error(e);
                    return;
                }
            };
            (low, high, scale_double(message.param_f64("bucket", 0.0)))
        }
        ColumnType::Bool => {
            let low = matches!(low_raw.as_str(), "true" | "1") as i64;
            (low, 0, 0)
        }
        ColumnType::Text => {
            needle = Some(low_raw.clone());
            (evq_common::hash_bytes(low_raw.as_bytes()), 0, 0)
        }
    };

    // mode × type consistency
    if mode != ColumnQueryMode::All && mode != ColumnQueryMode::Eq {
        match column.kind {
            ColumnType::Int | ColumnType::Double => {
                if !matches!(
                    mode,
                    ColumnQueryMode::Between
                        | ColumnQueryMode::Gt
                        | ColumnQueryMode::Gte
                        | ColumnQueryMode::Lt
                        | ColumnQueryMode::Lte
                ) {
                    message.reply_error(EvqError::query_syntax(
                        "specified filter type not compatible with integer or double column",
                    ));
                    return;
                }
            }
            ColumnType::Text => {
                if !matches!(mode, ColumnQueryMode::Rx | ColumnQueryMode::Sub) {
                    message.reply_error(EvqError::query_syntax(
                        "specified filter type not compatible with string column",
                    ));
                    return;
                }
            }
            ColumnType::Bool => {}
        }
    }

    if !is_fork {
        let spec = ForkMergeSpec::plain(
            SortMode::Column(0),
            sort_order(message),
            message.param_i64("trim", -1),
        );
        if let Some(json) = fork_query(runtime, message, "column", &spec) {
            message.reply_json(200, &json);
        }
        return;
    }

    let config = ColumnQueryConfig {
        column: column.clone(),
        mode,
        low,
        high,
        needle,
        rx,
        bucket,
        segments: segments.clone(),
    };
    let columns = vec![ColumnDescriptor::new(
        column.name.clone(),
        ColumnKind::Int,
        Reducer::Sum,
    )];
    fork_execute(
        runtime,
        message,
        &table,
        columns,
        segments.len().max(1),
        HashMap::new(),
        |shuttle, slot, instance| {
            Box::new(OpenLoopColumn::new(
                shuttle,
                Arc::clone(&table),
                config.clone(),
                slot,
                instance,
            ))
        },
    );
}

/// `POST /v1/query/{table}/histogram/{name}`
pub fn histogram(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str, name: &str) {
    global_metrics().inc_query("histogram", table_name);
    let is_fork = message.param_bool("fork");
    info!(table = table_name, fork = is_fork, "inbound histogram query");

    if let Err(e) = require_body(message) {
        message.reply_error(e);
        return;
    }
    let table = match runtime.database.get_or_err(table_name) {
        Ok(t) => t,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    let session_time = message.param_i64("session_time", table.session_time_ms());
    let mut macros = match compile_for(runtime, message, &table) {
        Ok(m) => m,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    // histogram scripts must `return` their value, never tally
    if macros.marshals.contains(&Marshal::Tally) {
        message.reply_error(EvqError::parse(
            "histogram queries should not call 'tally'. They should 'return' the value to store.",
        ));
        return;
    }

    match segments_param(message) {
        Ok(Some(segments)) => macros.segments = segments,
        Ok(None) => {}
        Err(e) => {
            message.reply_error(e);
            return;
        }
    }
    macros.session_time_ms = session_time;
    if let Some(first) = macros.columns.first_mut() {
        first.name = name.to_string();
    }

    if message.param_bool("debug") {
        message.reply(200, macros.dump.clone().into_bytes());
        return;
    }

    let bucket = scale_double(message.param_f64("bucket", 0.0));
    let force_min = if message.is_param("min") {
        scale_double(message.param_f64("min", 0.0))
    } else {
        USE_OBSERVED
    };
    let force_max = if message.is_param("max") {
        scale_double(message.param_f64("max", 0.0))
    } else {
        USE_OBSERVED
    };

    if !is_fork {
        let spec = ForkMergeSpec {
            sort: SortMode::Key,
            order: sort_order(message),
            trim: message.param_i64("trim", -1),
            bucket,
            force_min,
            force_max,
        };
        if let Some(json) = fork_query(runtime, message, "histogram", &spec) {
            message.reply_json(200, &json);
        }
        return;
    }

    let columns = macros.columns.clone();
    let set_count = macros.set_count();
    let literals = macros.literals.clone();
    fork_execute(
        runtime,
        message,
        &table,
        columns,
        set_count,
        literals,
        |shuttle, slot, instance| {
            Box::new(OpenLoopHistogram::new(
                shuttle,
                Arc::clone(&table),
                macros.clone(),
                bucket,
                slot,
                instance,
            ))
        },
    );
}

/// `GET /v1/query/{table}/person`
pub fn person(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str) {
    global_metrics().inc_query("person", table_name);

    let sid = message.param_str("sid", "");
    let mut uuid = message.param_i64("id", 0);
    if uuid == 0 && !sid.is_empty() {
        uuid = hash_actor_id(&sid);
    }
    if uuid == 0 {
        message.reply_error(EvqError::query(
            "person query must have an id={number} or idstring={text} parameter",
        ));
        return;
    }

    let table = match runtime.database.get_or_err(table_name) {
        Ok(t) => t,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };

    let target = PartitionId(partition_for(uuid, runtime.pool.partition_max()));
    let Some(owner) = runtime.mapper.owner_for_partition(target) else {
        message.reply_error(EvqError::route());
        return;
    };

    if owner == runtime.mapper.self_node() {
        let Some(l) = runtime.pool.get_partition(target) else {
            message.reply_error(EvqError::route());
            return;
        };
        let message_cb = Arc::clone(message);
        let shuttle = Arc::new(Shuttle::new(
            1,
            move |mut responses: Vec<CellResponse<serde_json::Value>>| {
                let response = responses.pop().expect("person shuttle expects one arrival");
                match (response.error, response.data) {
                    (Some(error), _) => message_cb.reply_error(error),
                    (None, Some(body)) => message_cb.reply_json(200, &body),
                    (None, None) => {
                        message_cb.reply_error(EvqError::query("person could not be found"))
                    }
                }
            },
        ));
        l.queue_cell(Box::new(OpenLoopPerson::new(shuttle, table, uuid)));
    } else {
        // remote: route to the owning node and relay its reply verbatim
        match runtime.mapper.dispatch_sync(
            owner,
            message.method(),
            message.path(),
            message.params(),
            message.body(),
        ) {
            Ok(block) => message.reply(block.status, block.data),
            Err(_) => message.reply_error(EvqError::route()),
        }
    }
}

fn batch_request_for(
    table: &str,
    section: &SectionDefinition,
    segments: &[String],
) -> (String, String, Vec<(String, String)>, String) {
    let mut params: Vec<(String, String)> = section
        .flags
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "ttl" | "refresh" | "on_insert"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !segments.is_empty() {
        params.push(("segments".to_string(), segments.join(",")));
    }
    match section.section_type.as_str() {
        "segment" => {
            let mut header = format!("@segment {} ", section.section_name);
            for (k, v) in &section.flags {
                header.push_str(&format!("{k}={v} "));
            }
            header.push('\n');
            (
                "POST".to_string(),
                format!("/v1/query/{table}/segment"),
                params,
                header + &section.code,
            )
        }
        "column" => (
            "GET".to_string(),
            format!("/v1/query/{table}/column/{}", section.section_name),
            params,
            section.code.clone(),
        ),
        "histogram" => (
            "POST".to_string(),
            format!("/v1/query/{table}/histogram/{}", section.section_name),
            params,
            section.code.clone(),
        ),
        _ => (
            "POST".to_string(),
            format!("/v1/query/{table}/event"),
            params,
            section.code.clone(),
        ),
    }
}

/// Fan sections out against self through the full HTTP+mapper path,
/// bounded by `run_max` in flight, preserving dispatch order.
fn batch_dispatch(
    runtime: &Arc<NodeRuntime>,
    table: &str,
    segments: &[String],
    sections: &[SectionDefinition],
    run_max: usize,
) -> (Vec<DataBlock>, bool) {
    let total = sections.len();
    let mut slots: Vec<Option<DataBlock>> = (0..total).map(|_| None).collect();
    let mut route_error = false;
    let (tx, rx) = mpsc::channel::<(usize, DataBlock)>();

    let mut next = 0_usize;
    let mut in_flight = 0_usize;
    let mut done = 0_usize;
    let self_node = runtime.mapper.self_node();

    while done < total {
        while in_flight < run_max && next < total {
            let at = next;
            next += 1;
            let (method, path, params, payload) =
                batch_request_for(table, &sections[at], segments);
            let tx = tx.clone();
            let sent = runtime.mapper.dispatch_async(
                self_node,
                &method,
                &path,
                &params,
                payload.as_bytes(),
                move |block| {
                    let _ = tx.send((at, block));
                },
            );
            if sent {
                in_flight += 1;
            } else {
                route_error = true;
                slots[at] = Some(DataBlock {
                    data: Vec::new(),
                    status: 0,
                });
                done += 1;
            }
        }
        if in_flight == 0 {
            break;
        }
        match rx.recv_timeout(BATCH_REPLY_TIMEOUT) {
            Ok((at, block)) => {
                slots[at] = Some(block);
                in_flight -= 1;
                done += 1;
            }
            Err(_) => {
                route_error = true;
                break;
            }
        }
    }

    let blocks = slots
        .into_iter()
        .map(|s| {
            s.unwrap_or(DataBlock {
                data: Vec::new(),
                status: 0,
            })
        })
        .collect();
    (blocks, route_error)
}

/// Inspect inner replies: forward an embedded JSON error verbatim, turn
/// anything else non-OK into a route error. Returns false when a reply
/// has already gone out.
fn batch_check(message: &MessagePtr, blocks: &[DataBlock], mut route_error: bool) -> bool {
    for block in blocks {
        if block.is_ok() {
            continue;
        }
        if block.data.first() == Some(&b'{')
            && std::str::from_utf8(&block.data)
                .map(|s| s.contains("\"error\""))
                .unwrap_or(false)
        {
            message.reply(400, block.data.clone());
            return false;
        }
        route_error = true;
    }
    if route_error {
        message.reply_error(EvqError::route());
        return false;
    }
    true
}

/// `POST /v1/query/{table}/batch`
///
/// Runs on its own thread so the long-running inner dispatches never
/// hold a query-lane admission slot (three batches would otherwise
/// starve their own inner queries).
pub fn batch(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str) {
    global_metrics().inc_query("batch", table_name);
    info!(table = table_name, "inbound multi query");

    if let Err(e) = require_body(message) {
        message.reply_error(e);
        return;
    }
    if runtime.database.get(table_name).is_none() {
        message.reply_error(EvqError::query("table could not be found"));
        return;
    }

    let runtime = Arc::clone(runtime);
    let message = Arc::clone(message);
    let table_name = table_name.to_string();
    std::thread::spawn(move || {
        let sections = extract_sections(&message.body_text());
        let mut segment_list = Vec::new();
        let mut query_list = Vec::new();
        let mut use_segments: Vec<String> = Vec::new();
        for section in sections {
            match section.section_type.as_str() {
                "segment" => segment_list.push(section),
                "use" => {
                    use_segments = section
                        .section_name
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                _ => query_list.push(section),
            }
        }

        if !segment_list.is_empty() {
            // segments run one at a time so later queries can see their
            // side effects in the table's segment registry
            let (blocks, route_error) =
                batch_dispatch(&runtime, &table_name, &use_segments, &segment_list, 1);
            if !batch_check(&message, &blocks, route_error) {
                return;
            }
        }

        if query_list.is_empty() {
            message.reply_json(200, &serde_json::json!({ "_": [] }));
            return;
        }

        let (blocks, route_error) = batch_dispatch(
            &runtime,
            &table_name,
            &use_segments,
            &query_list,
            BATCH_RUN_MAX,
        );
        if !batch_check(&message, &blocks, route_error) {
            return;
        }

        let mut items = Vec::with_capacity(blocks.len());
        for block in &blocks {
            match serde_json::from_slice::<serde_json::Value>(&block.data) {
                Ok(value) => items.push(value),
                Err(_) => {
                    message.reply_error(EvqError::route());
                    return;
                }
            }
        }
        message.reply_json(200, &serde_json::json!({ "_": items }));
    });
}

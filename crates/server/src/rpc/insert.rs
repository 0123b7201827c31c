//! Ingest handler. Non-durable by design: events are parsed, routed by
//! actor hash, and applied through per-partition insert cells; rows for
//! partitions owned elsewhere are forwarded to their owning node.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use evq_common::{
    global_metrics, hash_actor_id, now_ms, partition_for, scale_double, EvqError, NodeId,
    PartitionId,
};
use evq_engine::{CellResponse, ColumnType, InsertRow, OpenLoopInsert, Shuttle};

use crate::message::MessagePtr;
use crate::state::NodeRuntime;

fn parse_row(
    row: &Value,
    schema: &evq_engine::TableSchema,
) -> Result<(i64, Option<String>, InsertRow), EvqError> {
    let id_string = row
        .get("id_string")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let id_hash = match (row.get("id").and_then(|v| v.as_i64()), &id_string) {
        (Some(id), _) => id,
        (None, Some(s)) => hash_actor_id(s),
        (None, None) => {
            return Err(EvqError::query(
                "insert row requires an 'id' or 'id_string' member",
            ))
        }
    };
    let stamp = row.get("stamp").and_then(|v| v.as_i64()).unwrap_or(now_ms());

    let mut values = Vec::new();
    let mut literals = Vec::new();
    if let Some(map) = row.get("values").and_then(|v| v.as_object()) {
        for (name, value) in map {
            let column = schema
                .column(name)
                .ok_or_else(|| EvqError::query(format!("unknown column '{name}'")))?;
            let scaled = match column.kind {
                ColumnType::Int => value
                    .as_i64()
                    .or_else(|| value.as_f64().map(|f| f.round() as i64))
                    .ok_or_else(|| EvqError::query(format!("invalid int value for '{name}'")))?,
                ColumnType::Double => scale_double(
                    value
                        .as_f64()
                        .ok_or_else(|| EvqError::query(format!("invalid double value for '{name}'")))?,
                ),
                ColumnType::Bool => value
                    .as_bool()
                    .map(|b| b as i64)
                    .ok_or_else(|| EvqError::query(format!("invalid bool value for '{name}'")))?,
                ColumnType::Text => {
                    let text = value
                        .as_str()
                        .ok_or_else(|| EvqError::query(format!("invalid text value for '{name}'")))?;
                    let hash = evq_common::hash_bytes(text.as_bytes());
                    literals.push((hash, text.to_string()));
                    hash
                }
            };
            values.push((column.index, scaled));
        }
    }

    Ok((
        id_hash,
        id_string.clone(),
        InsertRow {
            id_hash,
            id_string,
            stamp,
            values,
            literals,
        },
    ))
}

/// `POST /v1/insert/{table}`
pub fn insert(runtime: &Arc<NodeRuntime>, message: &MessagePtr, table_name: &str) {
    global_metrics().inc_query("insert", table_name);
    let is_fork = message.param_bool("fork");

    let table = match runtime.database.get_or_err(table_name) {
        Ok(t) => t,
        Err(e) => {
            message.reply_error(e);
            return;
        }
    };
    let rows: Vec<Value> = match serde_json::from_slice::<Value>(message.body()) {
        Ok(Value::Array(rows)) => rows,
        Ok(_) => {
            message.reply_error(EvqError::query("insert body must be a JSON array of events"));
            return;
        }
        Err(e) => {
            message.reply_error(EvqError::query(format!("invalid insert body: {e}")));
            return;
        }
    };

    let schema = table.schema();
    let partition_max = runtime.pool.partition_max();
    let self_node = runtime.mapper.self_node();

    let mut local: HashMap<PartitionId, Vec<InsertRow>> = HashMap::new();
    let mut remote: HashMap<NodeId, Vec<Value>> = HashMap::new();
    for raw in &rows {
        let (id_hash, _, row) = match parse_row(raw, &schema) {
            Ok(parsed) => parsed,
            Err(e) => {
                message.reply_error(e);
                return;
            }
        };
        let partition = PartitionId(partition_for(id_hash, partition_max));
        let owner = runtime.mapper.owner_for_partition(partition);
        if is_fork || owner == Some(self_node) || owner.is_none() {
            local.entry(partition).or_default().push(row);
        } else if let Some(owner) = owner {
            remote.entry(owner).or_default().push(raw.clone());
        }
    }

    let mut forwarded = 0_usize;
    for (node, batch) in remote {
        let payload = Value::Array(batch.clone()).to_string();
        let sent = runtime.mapper.dispatch_sync(
            node,
            "POST",
            message.path(),
            &[("fork".to_string(), "true".to_string())],
            payload.as_bytes(),
        );
        match sent {
            Ok(block) if block.is_ok() => forwarded += batch.len(),
            _ => {
                message.reply_error(EvqError::route());
                return;
            }
        }
    }

    if local.is_empty() {
        message.reply_json(200, &serde_json::json!({ "inserted": forwarded }));
        return;
    }

    info!(table = table_name, partitions = local.len(), "insert batch");
    let message_cb = Arc::clone(message);
    let shuttle = Arc::new(Shuttle::new(
        local.len(),
        move |responses: Vec<CellResponse<usize>>| {
            for r in &responses {
                if let Some(error) = &r.error {
                    message_cb.reply_error(error.clone());
                    return;
                }
            }
            let applied: usize = responses.iter().filter_map(|r| r.data).sum();
            message_cb.reply_json(
                200,
                &serde_json::json!({ "inserted": applied + forwarded }),
            );
        },
    ));

    let mut instance = 0_usize;
    for (partition, batch) in local {
        instance += 1;
        match runtime.pool.get_partition(partition) {
            Some(l) => l.queue_cell(Box::new(OpenLoopInsert::new(
                Arc::clone(&shuttle),
                Arc::clone(&table),
                batch,
                instance,
            ))),
            None => shuttle.arrive(CellResponse::err(instance, EvqError::route())),
        }
    }
}

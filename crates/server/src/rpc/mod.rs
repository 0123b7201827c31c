//! RPC routing and handler-shared helpers.

pub mod insert;
pub mod query;

use std::sync::Arc;

use tracing::debug;

use evq_common::{EvqError, Result};
use evq_engine::{ParamValue, ParamVars};
use evq_result::{ColumnDescriptor, SortOrder};

use crate::message::MessagePtr;
use crate::state::NodeRuntime;

/// Route one dequeued message to its handler.
pub fn dispatch(runtime: &Arc<NodeRuntime>, message: MessagePtr) {
    let path = message.path().to_string();
    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    debug!(method = message.method(), path = %path, "rpc dispatch");
    match parts.as_slice() {
        ["v1", "query", table, "event"] => query::event(runtime, &message, table),
        ["v1", "query", table, "segment"] => query::segment(runtime, &message, table),
        ["v1", "query", table, "column", name] => query::column(runtime, &message, table, name),
        ["v1", "query", table, "histogram", name] => {
            query::histogram(runtime, &message, table, name)
        }
        ["v1", "query", table, "person"] => query::person(runtime, &message, table),
        ["v1", "query", table, "batch"] => query::batch(runtime, &message, table),
        ["v1", "insert", table] => insert::insert(runtime, &message, table),
        _ => message.reply(400, br#"{"error":"unknown request"}"#.to_vec()),
    }
}

/// Typed inline script parameters from `str_`/`int_`/`dbl_`/`bool_`
/// query-string prefixes.
pub fn inline_params(message: &MessagePtr) -> ParamVars {
    let mut out = ParamVars::new();
    for (key, value) in message.params() {
        if let Some(name) = key.strip_prefix("str_") {
            if !name.is_empty() {
                out.insert(name.to_string(), ParamValue::Str(value.clone()));
            }
        } else if let Some(name) = key.strip_prefix("int_") {
            if !name.is_empty() {
                out.insert(
                    name.to_string(),
                    ParamValue::Int(value.parse::<i64>().unwrap_or(0)),
                );
            }
        } else if let Some(name) = key.strip_prefix("dbl_") {
            if !name.is_empty() {
                out.insert(
                    name.to_string(),
                    ParamValue::Dbl(value.parse::<f64>().unwrap_or(0.0)),
                );
            }
        } else if let Some(name) = key.strip_prefix("bool_") {
            if !name.is_empty() {
                out.insert(
                    name.to_string(),
                    ParamValue::Bool(matches!(value.as_str(), "true" | "1")),
                );
            }
        }
    }
    out
}

/// Requested result ordering, default descending.
pub fn sort_order(message: &MessagePtr) -> SortOrder {
    if message.param_str("order", "desc") == "asc" {
        SortOrder::Asc
    } else {
        SortOrder::Desc
    }
}

/// How the originator orders merged rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// Lexicographically by group key.
    Key,
    /// By a nominated output column.
    Column(usize),
}

/// Resolve the `sort` parameter against the declared output columns.
///
/// `key`/`g` select key ordering; `person`/`people`/`stamp`/`session`
/// map to their reserved aliases before lookup. Any other name must
/// match a declared column.
pub fn resolve_sort(message: &MessagePtr, columns: &[ColumnDescriptor]) -> Result<SortMode> {
    let Some(raw) = message.param("sort") else {
        return Ok(SortMode::Column(0));
    };
    if raw == "key" || raw == "g" {
        return Ok(SortMode::Key);
    }
    let alias = match raw {
        "person" | "people" => "__uuid",
        "stamp" => "__stamp",
        "session" => "__session",
        other => other,
    };
    columns
        .iter()
        .position(|c| c.name == alias)
        .map(SortMode::Column)
        .ok_or_else(|| EvqError::parse("sort column not found in query aggregates"))
}

/// Comma-separated `segments` parameter; present-but-empty is an error.
pub fn segments_param(message: &MessagePtr) -> Result<Option<Vec<String>>> {
    let Some(raw) = message.param("segments") else {
        return Ok(None);
    };
    let segments: Vec<String> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if segments.is_empty() {
        return Err(EvqError::query_syntax("no segment names specified"));
    }
    Ok(Some(segments))
}

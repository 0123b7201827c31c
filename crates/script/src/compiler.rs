//! The basic directive compiler.
//!
//! EVQ treats the full scripting language as an external collaborator
//! behind the [`QueryCompiler`] seam. This compiler implements the small
//! directive subset the server and tests run end-to-end:
//!
//! ```text
//! # tally scripts (event queries)
//! aggregate: count, people, sum price as total
//! group: product
//! filter: price gt 10
//!
//! # histogram scripts: one scalar per actor
//! return sum price
//!
//! # segment bodies: one predicate, `all` for everyone
//! price gte 100
//! ```
//!
//! `$name` tokens are replaced from the typed inline parameters before
//! parsing. Anything unrecognised is a `parse/syntax_error`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evq_common::{hash_bytes, scale_double, EvqError, Result};
use evq_engine::query::{
    ActorProgram, ActorView, CompiledQuery, Marshal, ParamValue, ParamVars, QueryCompiler,
    TallySink,
};
use evq_engine::table::{Column, ColumnType, TableSchema};
use evq_engine::Event;
use evq_result::{ColumnDescriptor, ColumnKind, Reducer, RowKey};

/// Group key used when a tally script declares no `group:`.
const ROOT_GROUP: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

#[derive(Debug, Clone)]
struct Filter {
    column: Column,
    op: CmpOp,
    operand: i64,
    text: Option<String>,
}

impl Filter {
    fn event_passes(&self, event: &Event, view: &ActorView<'_>) -> bool {
        let Some(value) = event.value(self.column.index) else {
            return false;
        };
        match self.op {
            CmpOp::Eq => value == self.operand,
            CmpOp::Neq => value != self.operand,
            CmpOp::Gt => value > self.operand,
            CmpOp::Gte => value >= self.operand,
            CmpOp::Lt => value < self.operand,
            CmpOp::Lte => value <= self.operand,
            CmpOp::Contains => {
                let Some(needle) = self.text.as_deref() else {
                    return false;
                };
                view.partition
                    .literal(value)
                    .map(|t| t.contains(needle))
                    .unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggKind {
    Count,
    People,
    Sessions,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone)]
struct Agg {
    kind: AggKind,
    column: Option<Column>,
}

struct TallyProgram {
    aggs: Vec<Agg>,
    group: Option<Column>,
    filter: Option<Filter>,
    root_hash: i64,
}

impl TallyProgram {
    fn group_keys(&self, filtered: &[&Event], view: &ActorView<'_>, sink: &mut dyn TallySink) -> Vec<i64> {
        match &self.group {
            None => vec![self.root_hash],
            Some(column) => {
                let mut seen = HashSet::new();
                let mut keys = Vec::new();
                for event in filtered {
                    let Some(v) = event.value(column.index) else {
                        continue;
                    };
                    if seen.insert(v) {
                        if column.kind == ColumnType::Text {
                            if let Some(text) = view.partition.literal(v) {
                                sink.intern(v, text);
                            }
                        }
                        keys.push(v);
                    }
                }
                keys
            }
        }
    }
}

impl ActorProgram for TallyProgram {
    fn exec(&self, view: &ActorView<'_>, sink: &mut dyn TallySink) -> Result<()> {
        let filtered: Vec<&Event> = view
            .actor
            .events
            .iter()
            .filter(|e| {
                self.filter
                    .as_ref()
                    .map(|f| f.event_passes(e, view))
                    .unwrap_or(true)
            })
            .collect();
        if filtered.is_empty() {
            return Ok(());
        }
        sink.intern(self.root_hash, ROOT_GROUP);

        for key_value in self.group_keys(&filtered, view, sink) {
            let in_group: Vec<&&Event> = match &self.group {
                None => filtered.iter().collect(),
                Some(column) => filtered
                    .iter()
                    .filter(|e| e.value(column.index) == Some(key_value))
                    .collect(),
            };
            let key = RowKey::single(key_value);
            for (at, agg) in self.aggs.iter().enumerate() {
                let value = match agg.kind {
                    AggKind::Count => Some(in_group.len() as i64),
                    AggKind::People => Some(1),
                    AggKind::Sessions => Some(view.session_count() as i64),
                    AggKind::Sum | AggKind::Min | AggKind::Max => {
                        let column = agg.column.as_ref().expect("value agg carries a column");
                        let mut folded: Option<i64> = None;
                        for event in &in_group {
                            let Some(v) = event.value(column.index) else {
                                continue;
                            };
                            folded = Some(match (folded, agg.kind) {
                                (None, _) => v,
                                (Some(f), AggKind::Sum) => f.wrapping_add(v),
                                (Some(f), AggKind::Min) => f.min(v),
                                (Some(f), AggKind::Max) => f.max(v),
                                (Some(f), _) => f,
                            });
                        }
                        folded
                    }
                };
                if let Some(value) = value {
                    sink.tally(&key, at, value);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ScalarExpr {
    Count,
    Sessions,
    Sum(Column),
    Min(Column),
    Max(Column),
    Last(Column),
}

struct ScalarProgram {
    expr: ScalarExpr,
    filter: Option<Filter>,
}

impl ActorProgram for ScalarProgram {
    fn exec_scalar(&self, view: &ActorView<'_>) -> Result<Option<i64>> {
        let filtered: Vec<&Event> = view
            .actor
            .events
            .iter()
            .filter(|e| {
                self.filter
                    .as_ref()
                    .map(|f| f.event_passes(e, view))
                    .unwrap_or(true)
            })
            .collect();
        if filtered.is_empty() {
            return Ok(None);
        }
        let out = match &self.expr {
            ScalarExpr::Count => Some(filtered.len() as i64),
            ScalarExpr::Sessions => Some(view.session_count() as i64),
            ScalarExpr::Sum(c) | ScalarExpr::Min(c) | ScalarExpr::Max(c) => {
                let mut folded: Option<i64> = None;
                for event in &filtered {
                    let Some(v) = event.value(c.index) else { continue };
                    folded = Some(match (folded, &self.expr) {
                        (None, _) => v,
                        (Some(f), ScalarExpr::Sum(_)) => f.wrapping_add(v),
                        (Some(f), ScalarExpr::Min(_)) => f.min(v),
                        (Some(f), ScalarExpr::Max(_)) => f.max(v),
                        (Some(f), _) => f,
                    });
                }
                folded
            }
            ScalarExpr::Last(c) => filtered.iter().rev().find_map(|e| e.value(c.index)),
        };
        Ok(out)
    }
}

struct PredicateProgram {
    filter: Option<Filter>,
}

impl ActorProgram for PredicateProgram {
    fn exec_predicate(&self, view: &ActorView<'_>) -> Result<bool> {
        match &self.filter {
            None => Ok(!view.actor.events.is_empty()),
            Some(f) => Ok(view
                .actor
                .events
                .iter()
                .any(|e| f.event_passes(e, view))),
        }
    }
}

/// The shipped [`QueryCompiler`] implementation.
#[derive(Debug, Default)]
pub struct BasicCompiler;

impl BasicCompiler {
    /// Shared-ready instance.
    pub fn new() -> Self {
        Self
    }
}

fn substitute_params(source: &str, params: &ParamVars) -> String {
    let mut out = source.to_string();
    for (name, value) in params {
        let token = format!("${name}");
        let rendered = match value {
            ParamValue::Str(s) => s.clone(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Dbl(d) => d.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        };
        out = out.replace(&token, &rendered);
    }
    out
}

fn lookup_column(schema: &TableSchema, name: &str) -> Result<Column> {
    schema
        .column(name)
        .cloned()
        .ok_or_else(|| EvqError::parse(format!("unknown column '{name}'")))
}

fn parse_operand(column: &Column, word: &str) -> Result<(i64, Option<String>)> {
    let unquoted = word.trim_matches('\'').trim_matches('"');
    match column.kind {
        ColumnType::Int => {
            let v = unquoted
                .parse::<i64>()
                .or_else(|_| unquoted.parse::<f64>().map(|f| f.round() as i64))
                .map_err(|_| EvqError::parse(format!("invalid integer operand '{word}'")))?;
            Ok((v, None))
        }
        ColumnType::Double => {
            let v = unquoted
                .parse::<f64>()
                .map_err(|_| EvqError::parse(format!("invalid double operand '{word}'")))?;
            Ok((scale_double(v), None))
        }
        ColumnType::Bool => match unquoted {
            "true" | "1" => Ok((1, None)),
            "false" | "0" => Ok((0, None)),
            _ => Err(EvqError::parse(format!("invalid bool operand '{word}'"))),
        },
        ColumnType::Text => Ok((hash_bytes(unquoted.as_bytes()), Some(unquoted.to_string()))),
    }
}

fn parse_op(word: &str) -> Result<CmpOp> {
    Ok(match word {
        "eq" | "==" | "is" => CmpOp::Eq,
        "neq" | "!=" => CmpOp::Neq,
        "gt" | ">" => CmpOp::Gt,
        "gte" | ">=" => CmpOp::Gte,
        "lt" | "<" => CmpOp::Lt,
        "lte" | "<=" => CmpOp::Lte,
        "contains" => CmpOp::Contains,
        other => return Err(EvqError::parse(format!("unknown operator '{other}'"))),
    })
}

fn parse_filter(schema: &TableSchema, tokens: &[&str]) -> Result<Filter> {
    if tokens.len() != 3 {
        return Err(EvqError::parse(
            "filter expects '<column> <op> <value>'".to_string(),
        ));
    }
    let column = lookup_column(schema, tokens[0])?;
    let op = parse_op(tokens[1])?;
    let (operand, text) = parse_operand(&column, tokens[2])?;
    if op == CmpOp::Contains && column.kind != ColumnType::Text {
        return Err(EvqError::parse("'contains' requires a text column"));
    }
    Ok(Filter {
        column,
        op,
        operand,
        text,
    })
}

fn descriptor_for_agg(kind: AggKind, column: Option<&Column>, alias: &str) -> ColumnDescriptor {
    match kind {
        AggKind::Count | AggKind::People | AggKind::Sessions => {
            ColumnDescriptor::new(alias, ColumnKind::Int, Reducer::Count)
        }
        AggKind::Sum | AggKind::Min | AggKind::Max => {
            let col_kind = match column.map(|c| c.kind) {
                Some(ColumnType::Double) => ColumnKind::Double,
                _ => ColumnKind::Int,
            };
            let reducer = match kind {
                AggKind::Min => Reducer::Min,
                AggKind::Max => Reducer::Max,
                _ => Reducer::Sum,
            };
            ColumnDescriptor::new(alias, col_kind, reducer)
        }
    }
}

fn scalar_column_kind(expr: &ScalarExpr) -> ColumnKind {
    match expr {
        ScalarExpr::Count | ScalarExpr::Sessions => ColumnKind::Int,
        ScalarExpr::Sum(c) | ScalarExpr::Min(c) | ScalarExpr::Max(c) | ScalarExpr::Last(c) => {
            match c.kind {
                ColumnType::Double => ColumnKind::Double,
                _ => ColumnKind::Int,
            }
        }
    }
}

fn base_query(program: Arc<dyn ActorProgram>, dump: String) -> CompiledQuery {
    CompiledQuery {
        columns: Vec::new(),
        index_count: 1,
        segments: Vec::new(),
        session_time_ms: 0,
        is_segment: false,
        segment_ttl_ms: None,
        segment_refresh_ms: None,
        on_insert: false,
        marshals: HashSet::new(),
        literals: HashMap::new(),
        program,
        dump,
    }
}

fn compile_tally(schema: &TableSchema, lines: &[&str]) -> Result<CompiledQuery> {
    let mut aggs: Vec<Agg> = Vec::new();
    let mut columns: Vec<ColumnDescriptor> = Vec::new();
    let mut group: Option<Column> = None;
    let mut filter: Option<Filter> = None;
    let mut dump = String::new();

    for line in lines {
        if let Some(rest) = line.strip_prefix("aggregate:") {
            for item in rest.split(',') {
                let words: Vec<&str> = item.split_whitespace().collect();
                if words.is_empty() {
                    continue;
                }
                let (spec, alias) = match words.iter().position(|w| *w == "as") {
                    Some(at) => {
                        let alias = words
                            .get(at + 1)
                            .ok_or_else(|| EvqError::parse("'as' requires an alias"))?;
                        (&words[..at], Some(alias.to_string()))
                    }
                    None => (&words[..], None),
                };
                let (kind, column) = match spec {
                    ["count"] => (AggKind::Count, None),
                    ["people"] => (AggKind::People, None),
                    ["sessions"] => (AggKind::Sessions, None),
                    ["sum", col] => (AggKind::Sum, Some(lookup_column(schema, col)?)),
                    ["min", col] => (AggKind::Min, Some(lookup_column(schema, col)?)),
                    ["max", col] => (AggKind::Max, Some(lookup_column(schema, col)?)),
                    _ => {
                        return Err(EvqError::parse(format!(
                            "unknown aggregate '{}'",
                            spec.join(" ")
                        )))
                    }
                };
                let alias = alias.unwrap_or_else(|| match (&kind, &column) {
                    (AggKind::Count, _) => "count".to_string(),
                    (AggKind::People, _) => "people".to_string(),
                    (AggKind::Sessions, _) => "sessions".to_string(),
                    (_, Some(c)) => c.name.clone(),
                    (_, None) => "value".to_string(),
                });
                columns.push(descriptor_for_agg(kind, column.as_ref(), &alias));
                aggs.push(Agg { kind, column });
            }
            dump.push_str(line);
            dump.push('\n');
        } else if let Some(rest) = line.strip_prefix("group:") {
            let name = rest.trim();
            group = Some(lookup_column(schema, name)?);
            dump.push_str(line);
            dump.push('\n');
        } else if let Some(rest) = line.strip_prefix("filter:") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            filter = Some(parse_filter(schema, &tokens)?);
            dump.push_str(line);
            dump.push('\n');
        } else {
            return Err(EvqError::parse(format!("unknown directive '{line}'")));
        }
    }

    if aggs.is_empty() {
        return Err(EvqError::parse("aggregate list is empty"));
    }

    let root_hash = hash_bytes(ROOT_GROUP.as_bytes());
    let mut query = base_query(
        Arc::new(TallyProgram {
            aggs,
            group,
            filter,
            root_hash,
        }),
        dump,
    );
    query.columns = columns;
    query.marshals.insert(Marshal::Tally);
    query.literals.insert(root_hash, ROOT_GROUP.to_string());
    Ok(query)
}

fn compile_scalar(schema: &TableSchema, lines: &[&str], references_tally: bool) -> Result<CompiledQuery> {
    let mut expr: Option<ScalarExpr> = None;
    let mut filter: Option<Filter> = None;
    let mut dump = String::new();

    for line in lines {
        if *line == "return" || line.starts_with("return ") {
            let rest = line.strip_prefix("return").unwrap_or_default();
            let words: Vec<&str> = rest.split_whitespace().collect();
            expr = Some(match words.as_slice() {
                ["count"] => ScalarExpr::Count,
                ["sessions"] => ScalarExpr::Sessions,
                ["sum", col] => ScalarExpr::Sum(lookup_column(schema, col)?),
                ["min", col] => ScalarExpr::Min(lookup_column(schema, col)?),
                ["max", col] => ScalarExpr::Max(lookup_column(schema, col)?),
                ["last", col] => ScalarExpr::Last(lookup_column(schema, col)?),
                _ => {
                    return Err(EvqError::parse(format!(
                        "unknown return expression '{}'",
                        words.join(" ")
                    )))
                }
            });
            dump.push_str(line);
            dump.push('\n');
        } else if let Some(rest) = line.strip_prefix("filter:") {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            filter = Some(parse_filter(schema, &tokens)?);
            dump.push_str(line);
            dump.push('\n');
        } else {
            return Err(EvqError::parse(format!("unknown directive '{line}'")));
        }
    }

    let expr = expr.ok_or_else(|| EvqError::parse("scalar script requires a 'return' line"))?;
    let kind = scalar_column_kind(&expr);
    let mut query = base_query(Arc::new(ScalarProgram { expr, filter }), dump);
    query.columns = vec![ColumnDescriptor::new("value", kind, Reducer::Count)];
    query.marshals.insert(Marshal::Return);
    if references_tally {
        query.marshals.insert(Marshal::Tally);
    }
    Ok(query)
}

fn compile_predicate(schema: &TableSchema, lines: &[&str]) -> Result<CompiledQuery> {
    let mut filter: Option<Filter> = None;
    let mut dump = String::new();
    for line in lines {
        if *line == "all" {
            filter = None;
        } else {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            filter = Some(parse_filter(schema, &tokens)?);
        }
        dump.push_str(line);
        dump.push('\n');
    }
    let mut query = base_query(Arc::new(PredicateProgram { filter }), dump);
    query.columns = vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Count)];
    Ok(query)
}

impl QueryCompiler for BasicCompiler {
    fn compile(
        &self,
        source: &str,
        schema: &TableSchema,
        params: &ParamVars,
    ) -> Result<CompiledQuery> {
        let substituted = substitute_params(source, params);
        let references_tally = substituted.contains("tally");
        let lines: Vec<&str> = substituted
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if lines.is_empty() {
            return Err(EvqError::parse("empty script"));
        }

        if lines.iter().any(|l| l.starts_with("aggregate:")) {
            compile_tally(schema, &lines)
        } else if lines
            .iter()
            .any(|l| *l == "return" || l.starts_with("return "))
        {
            compile_scalar(schema, &lines, references_tally)
        } else {
            compile_predicate(schema, &lines)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evq_engine::table::TableSchema;

    fn schema() -> TableSchema {
        TableSchema::new([
            ("product", ColumnType::Text),
            ("price", ColumnType::Double),
            ("qty", ColumnType::Int),
            ("returned", ColumnType::Bool),
        ])
    }

    #[test]
    fn tally_script_declares_columns_and_tally_marshal() {
        let q = BasicCompiler::new()
            .compile(
                "aggregate: count, sum price as total\ngroup: product\n",
                &schema(),
                &ParamVars::new(),
            )
            .expect("compiles");
        assert_eq!(q.columns.len(), 2);
        assert_eq!(q.columns[0].name, "count");
        assert_eq!(q.columns[1].name, "total");
        assert_eq!(q.columns[1].kind, ColumnKind::Double);
        assert!(q.marshals.contains(&Marshal::Tally));
    }

    #[test]
    fn scalar_script_does_not_reference_tally() {
        let q = BasicCompiler::new()
            .compile("return sum price\n", &schema(), &ParamVars::new())
            .expect("compiles");
        assert!(q.marshals.contains(&Marshal::Return));
        assert!(!q.marshals.contains(&Marshal::Tally));
    }

    #[test]
    fn unknown_column_is_a_parse_error() {
        let err = BasicCompiler::new()
            .compile("aggregate: sum frobnitz\n", &schema(), &ParamVars::new())
            .expect_err("unknown column");
        assert_eq!(err.class, evq_common::ErrorClass::Parse);
        assert!(err.message.contains("frobnitz"));
    }

    #[test]
    fn double_operands_scale_fixed_point() {
        let q = BasicCompiler::new()
            .compile(
                "aggregate: count\nfilter: price gt 10.5\n",
                &schema(),
                &ParamVars::new(),
            )
            .expect("compiles");
        assert!(q.dump.contains("price gt 10.5"));
    }

    #[test]
    fn params_substitute_before_parse() {
        let mut params = ParamVars::new();
        params.insert("floor".to_string(), ParamValue::Int(3));
        let q = BasicCompiler::new()
            .compile(
                "aggregate: count\nfilter: qty gte $floor\n",
                &schema(),
                &params,
            )
            .expect("compiles");
        assert!(q.dump.contains("qty gte 3"));
    }
}

//! JSON materialisation of merged result sets, plus the post-merge
//! group sort, column sort, trim, and histogram zero-fill passes the
//! originator applies before replying.

use std::cmp::Ordering;

use serde_json::{json, Map, Value};

use evq_common::unscale_double;

use crate::result_set::{ColumnKind, ResultSet, RowKey};

/// Sentinel meaning "use the observed bound" in [`histogram_fill`].
pub const USE_OBSERVED: i64 = i64::MIN;

/// Result ordering direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

fn render_key_part(set: &ResultSet, part: i64) -> Value {
    if let Some(text) = set.literals().get(&part) {
        return Value::String(text.clone());
    }
    json!(part)
}

fn render_key(set: &ResultSet, key: &RowKey) -> Value {
    if key.0.len() == 1 {
        render_key_part(set, key.0[0])
    } else {
        Value::Array(key.0.iter().map(|p| render_key_part(set, *p)).collect())
    }
}

fn render_cell(set: &ResultSet, column: usize, cell: Option<i64>) -> Value {
    let Some(value) = cell else {
        return Value::Null;
    };
    let kind = set
        .columns()
        .get(column)
        .map(|c| c.kind)
        .unwrap_or(ColumnKind::Int);
    match kind {
        ColumnKind::Int => json!(value),
        ColumnKind::Double => json!(unscale_double(value)),
        ColumnKind::Bool => json!(value != 0),
        ColumnKind::Text => set
            .literals()
            .get(&value)
            .map(|t| Value::String(t.clone()))
            .unwrap_or_else(|| json!(value)),
    }
}

/// Merge per-node result sets and materialise them as the client JSON
/// reply `{"_": [{"g": key, "c": [cells]}, ...]}` in key-table insertion
/// order. Group keys stay in storage units (scaled fixed-point for
/// double-keyed histograms) so fill and sort operate losslessly.
pub fn merge_sets_to_json(sets: &[ResultSet]) -> Value {
    let merged = match ResultSet::merge_all(sets.iter()) {
        Some(m) => m,
        None => return json!({ "_": [] }),
    };
    let column_count = merged.columns().len().max(1);
    let mut rows = Vec::with_capacity(merged.row_count());
    for (key, cells) in merged.rows() {
        let rendered: Vec<Value> = cells
            .iter()
            .enumerate()
            .map(|(at, cell)| render_cell(&merged, at % column_count, *cell))
            .collect();
        let mut row = Map::new();
        row.insert("g".to_string(), render_key(&merged, key));
        row.insert("c".to_string(), Value::Array(rendered));
        rows.push(Value::Object(row));
    }
    json!({ "_": rows })
}

fn rows_mut(result: &mut Value) -> Option<&mut Vec<Value>> {
    result.get_mut("_")?.as_array_mut()
}

/// Total, deterministic ordering over JSON values: null < bool < number
/// < string < array < object; arrays element-wise then by length.
fn cmp_value(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(xi), Some(yi)) = (x.as_i64(), y.as_i64()) {
                xi.cmp(&yi)
            } else {
                let xf = x.as_f64().unwrap_or(f64::NAN);
                let yf = y.as_f64().unwrap_or(f64::NAN);
                xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xa, ya) in x.iter().zip(y.iter()) {
                let ord = cmp_value(xa, ya);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Order groups lexicographically by the group-key tuple.
pub fn sort_by_key(result: &mut Value, order: SortOrder) {
    let Some(rows) = rows_mut(result) else { return };
    rows.sort_by(|a, b| {
        let ord = cmp_value(&a["g"], &b["g"]);
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

/// Order groups by a nominated output column, tie-breaking ascending on
/// the group key so equal-valued rows come back in a reproducible order.
pub fn sort_by_column(result: &mut Value, order: SortOrder, column: usize) {
    let Some(rows) = rows_mut(result) else { return };
    rows.sort_by(|a, b| {
        let av = a["c"].get(column).unwrap_or(&Value::Null);
        let bv = b["c"].get(column).unwrap_or(&Value::Null);
        let ord = match order {
            SortOrder::Asc => cmp_value(av, bv),
            SortOrder::Desc => cmp_value(av, bv).reverse(),
        };
        ord.then_with(|| cmp_value(&a["g"], &b["g"]))
    });
}

/// Keep the first `n` rows when `n > 0`; non-positive `n` keeps all.
/// Applied after sort.
pub fn trim(result: &mut Value, n: i64) {
    if n <= 0 {
        return;
    }
    if let Some(rows) = rows_mut(result) {
        rows.truncate(n as usize);
    }
}

fn floor_to_bucket(value: i64, bucket: i64) -> i64 {
    value.div_euclid(bucket) * bucket
}

/// Expand the key space to every bucket between min and max inclusive,
/// assigning zero rows to absent buckets. `bucket` is in the column's
/// scaled units; bounds use [`USE_OBSERVED`] to follow the data.
/// Buckets are aligned to zero: every key is `floor(key/bucket)*bucket`.
pub fn histogram_fill(result: &mut Value, bucket: i64, force_min: i64, force_max: i64) {
    if bucket <= 0 {
        return;
    }
    let Some(rows) = rows_mut(result) else { return };

    let mut observed_min = i64::MAX;
    let mut observed_max = i64::MIN;
    let mut present: std::collections::HashSet<i64> = std::collections::HashSet::new();
    let mut arity = 1;
    for row in rows.iter() {
        let Some(k) = row["g"].as_i64() else { continue };
        observed_min = observed_min.min(k);
        observed_max = observed_max.max(k);
        present.insert(k);
        if let Some(cells) = row["c"].as_array() {
            arity = arity.max(cells.len());
        }
    }

    let min = if force_min == USE_OBSERVED {
        if observed_min == i64::MAX {
            return; // nothing observed, nothing forced
        }
        observed_min
    } else {
        force_min
    };
    let max = if force_max == USE_OBSERVED {
        if observed_max == i64::MIN {
            return;
        }
        observed_max
    } else {
        force_max
    };
    if min > max {
        return;
    }

    let mut k = floor_to_bucket(min, bucket);
    let end = floor_to_bucket(max, bucket);
    while k <= end {
        if !present.contains(&k) {
            rows.push(json!({ "g": k, "c": vec![0; arity] }));
        }
        k = match k.checked_add(bucket) {
            Some(next) => next,
            None => break,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result_set::{ColumnDescriptor, Reducer};

    fn set_with_rows(rows: &[(i64, i64)]) -> ResultSet {
        let mut set = ResultSet::new(
            vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum)],
            1,
        );
        for (k, v) in rows {
            set.apply(&RowKey::single(*k), 0, 0, *v);
        }
        set
    }

    #[test]
    fn empty_input_renders_empty_result() {
        let out = merge_sets_to_json(&[]);
        assert_eq!(out, json!({ "_": [] }));
    }

    #[test]
    fn double_cells_unscale_and_text_keys_resolve() {
        let mut set = ResultSet::new(
            vec![ColumnDescriptor::new(
                "spend",
                ColumnKind::Double,
                Reducer::Sum,
            )],
            1,
        );
        let hash = evq_common::hash_actor_id("mobile");
        set.add_literal(hash, "mobile");
        set.apply(&RowKey::single(hash), 0, 0, 125_000);
        let out = merge_sets_to_json(&[set]);
        assert_eq!(out["_"][0]["g"], "mobile");
        assert_eq!(out["_"][0]["c"][0], 12.5);
    }

    #[test]
    fn sort_by_column_breaks_ties_on_key() {
        let mut out = merge_sets_to_json(&[set_with_rows(&[(3, 5), (1, 5), (2, 9)])]);
        sort_by_column(&mut out, SortOrder::Desc, 0);
        let keys: Vec<i64> = out["_"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["g"].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![2, 1, 3]);
    }

    #[test]
    fn trim_after_sort_keeps_prefix_and_minus_one_is_noop() {
        let mut out = merge_sets_to_json(&[set_with_rows(&[(1, 1), (2, 2), (3, 3)])]);
        sort_by_key(&mut out, SortOrder::Asc);
        trim(&mut out, -1);
        assert_eq!(out["_"].as_array().unwrap().len(), 3);
        trim(&mut out, 2);
        let keys: Vec<i64> = out["_"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["g"].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![1, 2]);
    }

    #[test]
    fn histogram_fill_zero_fills_aligned_buckets() {
        let mut out = merge_sets_to_json(&[set_with_rows(&[(10, 2), (40, 1)])]);
        histogram_fill(&mut out, 10, USE_OBSERVED, USE_OBSERVED);
        sort_by_key(&mut out, SortOrder::Asc);
        let rows = out["_"].as_array().unwrap();
        let keys: Vec<i64> = rows.iter().map(|r| r["g"].as_i64().unwrap()).collect();
        assert_eq!(keys, vec![10, 20, 30, 40]);
        assert_eq!(rows[1]["c"][0], 0);
    }

    #[test]
    fn histogram_fill_honours_forced_max() {
        let mut out = merge_sets_to_json(&[set_with_rows(&[(0, 1)])]);
        histogram_fill(&mut out, 5, USE_OBSERVED, 20);
        sort_by_key(&mut out, SortOrder::Asc);
        let keys: Vec<i64> = out["_"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["g"].as_i64().unwrap())
            .collect();
        assert_eq!(keys, vec![0, 5, 10, 15, 20]);
    }

    #[test]
    fn histogram_fill_aligns_negative_keys_toward_floor() {
        assert_eq!(floor_to_bucket(-3, 10), -10);
        assert_eq!(floor_to_bucket(-10, 10), -10);
        assert_eq!(floor_to_bucket(13, 10), 10);
    }
}

//! Per-(worker, request) aggregation buffer.
//!
//! Each worker thread owns exactly one `ResultSet` per in-flight request,
//! so the write path takes no locks. Cross-worker and cross-node merging
//! happens once, at the fan-in point, via [`ResultSet::merge_from`].

use std::collections::HashMap;

/// Schema type of an output column (and of histogram group keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit integer.
    Int,
    /// Double stored as scaled fixed-point (`round(x * 10_000)`).
    Double,
    /// Boolean stored as 0/1.
    Bool,
    /// Text stored as a 64-bit hash with the literal interned separately.
    Text,
}

/// Pairwise reduction rule applied when two accumulator cells merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Add values.
    Sum,
    /// Keep the smaller value.
    Min,
    /// Keep the larger value.
    Max,
    /// Add values (count columns tally increments of one).
    Count,
    /// Keep the first value seen; later values are ignored.
    First,
}

impl Reducer {
    fn apply(self, current: i64, incoming: i64) -> i64 {
        match self {
            Reducer::Sum | Reducer::Count => current.wrapping_add(incoming),
            Reducer::Min => current.min(incoming),
            Reducer::Max => current.max(incoming),
            Reducer::First => current,
        }
    }
}

/// One output column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Column alias as declared by the query.
    pub name: String,
    /// Value type used for JSON materialisation.
    pub kind: ColumnKind,
    /// Merge rule.
    pub reducer: Reducer,
}

impl ColumnDescriptor {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, kind: ColumnKind, reducer: Reducer) -> Self {
        Self {
            name: name.into(),
            kind,
            reducer,
        }
    }
}

/// Composite group key. Depth is bounded by [`RowKey::MAX_DEPTH`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(pub Vec<i64>);

impl RowKey {
    /// Maximum nesting depth carried on the wire.
    pub const MAX_DEPTH: usize = 8;

    /// Single-component key.
    pub fn single(value: i64) -> Self {
        Self(vec![value])
    }
}

/// Keyed aggregation rows with insertion-ordered key table.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Vec<ColumnDescriptor>,
    set_count: usize,
    key_kind: ColumnKind,
    rows: Vec<(RowKey, Vec<Option<i64>>)>,
    index: HashMap<RowKey, usize>,
    literals: HashMap<i64, String>,
}

impl ResultSet {
    /// Create an empty buffer with arity `columns.len() × max(1, set_count)`.
    pub fn new(columns: Vec<ColumnDescriptor>, set_count: usize) -> Self {
        Self {
            columns,
            set_count: set_count.max(1),
            key_kind: ColumnKind::Int,
            rows: Vec::new(),
            index: HashMap::new(),
            literals: HashMap::new(),
        }
    }

    /// Columns of this buffer.
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Segment/index set count (always at least 1).
    pub fn set_count(&self) -> usize {
        self.set_count
    }

    /// Accumulator cells per row.
    pub fn arity(&self) -> usize {
        self.columns.len() * self.set_count
    }

    /// Group-key value type, used when rendering keys to JSON.
    pub fn key_kind(&self) -> ColumnKind {
        self.key_kind
    }

    /// Override the group-key value type (histogram cells set `Double`).
    pub fn set_key_kind(&mut self, kind: ColumnKind) {
        self.key_kind = kind;
    }

    /// Number of distinct group keys.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows and no literals have been recorded.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.literals.is_empty()
    }

    /// Rows in key-table insertion order.
    pub fn rows(&self) -> impl Iterator<Item = (&RowKey, &[Option<i64>])> {
        self.rows.iter().map(|(k, cells)| (k, cells.as_slice()))
    }

    /// Interned text literals (hash → text).
    pub fn literals(&self) -> &HashMap<i64, String> {
        &self.literals
    }

    /// Intern one text literal.
    pub fn add_literal(&mut self, hash: i64, text: impl Into<String>) {
        self.literals.entry(hash).or_insert_with(|| text.into());
    }

    fn row_mut(&mut self, key: &RowKey) -> &mut Vec<Option<i64>> {
        let arity = self.arity();
        if let Some(&at) = self.index.get(key) {
            return &mut self.rows[at].1;
        }
        self.index.insert(key.clone(), self.rows.len());
        self.rows.push((key.clone(), vec![None; arity]));
        &mut self.rows.last_mut().expect("row just pushed").1
    }

    /// Fold `value` into the cell for `(key, column, set)` using the
    /// column's reducer. First write seeds the cell.
    pub fn apply(&mut self, key: &RowKey, column: usize, set: usize, value: i64) {
        debug_assert!(column < self.columns.len());
        debug_assert!(set < self.set_count);
        let reducer = self.columns[column].reducer;
        let at = set * self.columns.len() + column;
        let cell = &mut self.row_mut(key)[at];
        *cell = Some(match *cell {
            Some(current) => reducer.apply(current, value),
            None => value,
        });
    }

    /// Seed a whole row of zeros for `key` (histogram bucket fill).
    pub fn touch(&mut self, key: &RowKey) {
        self.row_mut(key);
    }

    /// Write a cell by flat index without applying a reducer (codec path).
    pub fn seed_cell(&mut self, key: &RowKey, at: usize, value: i64) {
        let row = self.row_mut(key);
        if at < row.len() {
            row[at] = Some(value);
        }
    }

    /// Fold every row and literal of `other` into `self`.
    ///
    /// Keys union; colliding cells reduce pairwise per column reducer.
    /// Merge is commutative and associative for every reducer except the
    /// ordering-sensitive `First`, which keeps the value of the receiver.
    pub fn merge_from(&mut self, other: &ResultSet) {
        debug_assert!(other.columns().is_empty() || self.arity() == other.arity());
        let column_count = self.columns.len().max(1);
        let reducers: Vec<Reducer> = self.columns.iter().map(|c| c.reducer).collect();
        for (key, cells) in other.rows() {
            let row = self.row_mut(key);
            let take = row.len().min(cells.len());
            for at in 0..take {
                let Some(incoming) = cells[at] else { continue };
                let reducer = reducers
                    .get(at % column_count)
                    .copied()
                    .unwrap_or(Reducer::Sum);
                row[at] = Some(match row[at] {
                    Some(current) => reducer.apply(current, incoming),
                    None => incoming,
                });
            }
        }
        for (hash, text) in other.literals.iter() {
            self.literals.entry(*hash).or_insert_with(|| text.clone());
        }
        if other.key_kind != ColumnKind::Int {
            self.key_kind = other.key_kind;
        }
    }

    /// Merge a sequence of sets into one. The base shape comes from the
    /// first set that declares columns, so a degenerate empty reply (a
    /// node whose active list emptied mid-request) cannot mask data
    /// from its peers.
    pub fn merge_all<'a>(sets: impl Iterator<Item = &'a ResultSet>) -> Option<ResultSet> {
        let sets: Vec<&ResultSet> = sets.collect();
        let base_at = sets
            .iter()
            .position(|s| !s.columns().is_empty())
            .unwrap_or(0);
        let mut merged = (*sets.get(base_at)?).clone();
        for (at, s) in sets.iter().enumerate() {
            if at != base_at {
                merged.merge_from(s);
            }
        }
        Some(merged)
    }
}

/// Merge compiler-emitted literals into every set so text group keys and
/// cells can be rendered after demux.
pub fn merge_macro_literals(literals: &HashMap<i64, String>, sets: &mut [ResultSet]) {
    for set in sets.iter_mut() {
        for (hash, text) in literals {
            set.add_literal(*hash, text.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_column() -> Vec<ColumnDescriptor> {
        vec![ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum)]
    }

    #[test]
    fn apply_reduces_in_place() {
        let mut rs = ResultSet::new(count_column(), 1);
        let key = RowKey::single(7);
        rs.apply(&key, 0, 0, 1);
        rs.apply(&key, 0, 0, 1);
        let (_, cells) = rs.rows().next().expect("one row");
        assert_eq!(cells[0], Some(2));
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let columns = vec![
            ColumnDescriptor::new("count", ColumnKind::Int, Reducer::Sum),
            ColumnDescriptor::new("low", ColumnKind::Int, Reducer::Min),
            ColumnDescriptor::new("high", ColumnKind::Int, Reducer::Max),
        ];
        let build = |seed: i64| {
            let mut rs = ResultSet::new(columns.clone(), 1);
            for k in 0..4_i64 {
                let key = RowKey::single(k);
                rs.apply(&key, 0, 0, seed + k);
                rs.apply(&key, 1, 0, seed * 10 + k);
                rs.apply(&key, 2, 0, seed * 10 + k);
            }
            rs
        };
        let (a, b, c) = (build(1), build(5), build(9));

        let abc = ResultSet::merge_all([&a, &b, &c].into_iter()).expect("sets");
        let cba = ResultSet::merge_all([&c, &b, &a].into_iter()).expect("sets");
        let ab_then_c = {
            let ab = ResultSet::merge_all([&a, &b].into_iter()).expect("sets");
            ResultSet::merge_all([&ab, &c].into_iter()).expect("sets")
        };

        // compare by key, not key-table position, since insertion order differs
        for probe in [&cba, &ab_then_c] {
            let mut left: Vec<_> = abc.rows().map(|(k, c)| (k.clone(), c.to_vec())).collect();
            let mut right: Vec<_> = probe.rows().map(|(k, c)| (k.clone(), c.to_vec())).collect();
            left.sort_by(|a, b| a.0.cmp(&b.0));
            right.sort_by(|a, b| a.0.cmp(&b.0));
            assert_eq!(left, right);
        }
    }

    #[test]
    fn rows_keep_insertion_order() {
        let mut rs = ResultSet::new(count_column(), 1);
        for k in [9_i64, 2, 5] {
            rs.apply(&RowKey::single(k), 0, 0, 1);
        }
        let keys: Vec<i64> = rs.rows().map(|(k, _)| k.0[0]).collect();
        assert_eq!(keys, vec![9, 2, 5]);
    }

    #[test]
    fn literals_union_on_merge() {
        let mut a = ResultSet::new(count_column(), 1);
        let mut b = ResultSet::new(count_column(), 1);
        a.add_literal(11, "mobile");
        b.add_literal(12, "desktop");
        a.merge_from(&b);
        assert_eq!(a.literals().len(), 2);
        assert_eq!(a.literals()[&12], "desktop");
    }
}

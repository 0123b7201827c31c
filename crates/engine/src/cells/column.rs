//! Column cell: scans distinct values of one column per actor with an
//! optional filter, grouping by value (and optional bucket), counting
//! actors. No script involved.

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

use evq_common::{global_metrics, EvqError};
use evq_result::{ResultSet, RowKey};

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::cells::{member_of, missing_segment, partition_removed_error, SLICE_ACTORS};
use crate::partition::TablePartition;
use crate::shuttle::{CellResponse, Shuttle};
use crate::table::{Column, ColumnType, Table};

/// Filter mode for a column distribution query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnQueryMode {
    /// No filter; every distinct value counts.
    All,
    /// Equal to `low`.
    Eq,
    /// Greater than `low`.
    Gt,
    /// Greater than or equal to `low`.
    Gte,
    /// Less than `low`.
    Lt,
    /// Less than or equal to `low`.
    Lte,
    /// Between `low` and `high` inclusive.
    Between,
    /// Text matches the compiled regex.
    Rx,
    /// Text contains the needle.
    Sub,
}

/// Validated column-query parameters, type-coerced by the RPC layer
/// before dispatch (doubles already scaled ×10,000).
#[derive(Debug, Clone)]
pub struct ColumnQueryConfig {
    /// Column under scan.
    pub column: Column,
    /// Filter mode.
    pub mode: ColumnQueryMode,
    /// Low bound / equality operand, in storage units.
    pub low: i64,
    /// High bound for `between`, in storage units.
    pub high: i64,
    /// Text operand for `sub`.
    pub needle: Option<String>,
    /// Compiled regex for `rx`.
    pub rx: Option<Regex>,
    /// Bucket width in storage units; 0 = exact values.
    pub bucket: i64,
    /// Restrict to these segments (empty = whole population).
    pub segments: Vec<String>,
}

impl ColumnQueryConfig {
    fn value_passes(&self, value: i64, parts: &TablePartition) -> bool {
        match self.column.kind {
            ColumnType::Int | ColumnType::Double => match self.mode {
                ColumnQueryMode::All => true,
                ColumnQueryMode::Eq => value == self.low,
                ColumnQueryMode::Gt => value > self.low,
                ColumnQueryMode::Gte => value >= self.low,
                ColumnQueryMode::Lt => value < self.low,
                ColumnQueryMode::Lte => value <= self.low,
                ColumnQueryMode::Between => value >= self.low && value <= self.high,
                ColumnQueryMode::Rx | ColumnQueryMode::Sub => false,
            },
            ColumnType::Bool => match self.mode {
                ColumnQueryMode::All => true,
                ColumnQueryMode::Eq => (value != 0) == (self.low != 0),
                _ => false,
            },
            ColumnType::Text => {
                let Some(text) = parts.literal(value) else {
                    return false;
                };
                match self.mode {
                    ColumnQueryMode::All => true,
                    ColumnQueryMode::Eq => value == self.low,
                    ColumnQueryMode::Rx => {
                        self.rx.as_ref().map(|rx| rx.is_match(text)).unwrap_or(false)
                    }
                    ColumnQueryMode::Sub => self
                        .needle
                        .as_deref()
                        .map(|n| text.contains(n))
                        .unwrap_or(false),
                    _ => false,
                }
            }
        }
    }
}

/// Per-partition executor for a column distribution query.
pub struct OpenLoopColumn {
    table: Arc<Table>,
    config: ColumnQueryConfig,
    shuttle: Arc<Shuttle<()>>,
    result: Arc<Mutex<ResultSet>>,
    instance: usize,
    state: CellState,
    parts: Option<Arc<Mutex<TablePartition>>>,
    cursor: usize,
    max_lin: usize,
    replied: bool,
}

impl OpenLoopColumn {
    /// Build a cell for the validated config.
    pub fn new(
        shuttle: Arc<Shuttle<()>>,
        table: Arc<Table>,
        config: ColumnQueryConfig,
        result: Arc<Mutex<ResultSet>>,
        instance: usize,
    ) -> Self {
        Self {
            table,
            config,
            shuttle,
            result,
            instance,
            state: CellState::Running,
            parts: None,
            cursor: 0,
            max_lin: 0,
            replied: false,
        }
    }

    fn reply_ok(&mut self) {
        if !self.replied {
            self.replied = true;
            self.shuttle.arrive(CellResponse::ok(self.instance, ()));
        }
        self.state = CellState::Done;
    }

    fn reply_err(&mut self, error: EvqError) {
        if !self.replied {
            self.replied = true;
            self.shuttle.arrive(CellResponse::err(self.instance, error));
        }
        self.state = CellState::Done;
    }
}

impl OpenLoop for OpenLoopColumn {
    fn owning_table(&self) -> &str {
        self.table.name()
    }

    fn state(&self) -> CellState {
        self.state
    }

    fn prepare(&mut self, ctx: &CellContext) {
        let parts = self.table.partition_or_create(ctx.partition);
        let missing = {
            let guard = parts.lock();
            self.max_lin = guard.actor_count();
            missing_segment(&guard, &self.config.segments)
        };
        if let Some(name) = missing {
            self.reply_err(EvqError::query(format!("missing segment '{name}'")));
            return;
        }
        self.parts = Some(parts);
    }

    fn run(&mut self, _ctx: &CellContext) -> bool {
        global_metrics().inc_cell_run("column");
        let Some(parts) = self.parts.clone() else {
            self.reply_ok();
            return false;
        };
        let sets: Vec<String> = if self.config.segments.is_empty() {
            vec!["*".to_string()]
        } else {
            self.config.segments.clone()
        };

        let finished = {
            let parts = parts.lock();
            let mut result = self.result.lock();
            let end = (self.cursor + SLICE_ACTORS).min(self.max_lin);
            while self.cursor < end {
                let lin = self.cursor;
                self.cursor += 1;
                let Some(actor) = parts.actor_by_lin(lin) else {
                    continue;
                };
                for value in actor.distinct_values(self.config.column.index) {
                    if !self.config.value_passes(value, &parts) {
                        continue;
                    }
                    let key_value = if self.config.bucket > 0 {
                        value.div_euclid(self.config.bucket) * self.config.bucket
                    } else {
                        value
                    };
                    if self.config.column.kind == ColumnType::Text {
                        if let Some(text) = parts.literal(value) {
                            result.add_literal(key_value, text.to_string());
                        }
                    }
                    let key = RowKey::single(key_value);
                    for (set_index, segment) in sets.iter().enumerate() {
                        if member_of(&parts, segment, lin) {
                            result.apply(&key, 0, set_index, 1);
                        }
                    }
                }
            }
            self.cursor >= self.max_lin
        };

        if finished {
            self.reply_ok();
            return false;
        }
        true
    }

    fn partition_removed(&mut self) {
        self.reply_err(partition_removed_error());
    }
}

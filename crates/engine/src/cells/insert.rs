//! Insert cell: applies a batch of routed events to its partition's
//! grid on the owning worker thread. Ingest is non-durable.

use std::sync::Arc;

use parking_lot::Mutex;

use evq_common::global_metrics;

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::cells::partition_removed_error;
use crate::partition::{Event, TablePartition};
use crate::shuttle::{CellResponse, Shuttle};
use crate::table::Table;

/// One pre-routed event destined for this cell's partition.
#[derive(Debug, Clone)]
pub struct InsertRow {
    /// Actor sharding hash.
    pub id_hash: i64,
    /// Original string id, when provided.
    pub id_string: Option<String>,
    /// Event timestamp, unix ms.
    pub stamp: i64,
    /// `(column index, scaled value)` pairs.
    pub values: Vec<(usize, i64)>,
    /// Text literals referenced by the values (hash → text).
    pub literals: Vec<(i64, String)>,
}

/// Applies one insert batch, then reports the applied row count.
pub struct OpenLoopInsert {
    table: Arc<Table>,
    rows: Vec<InsertRow>,
    shuttle: Arc<Shuttle<usize>>,
    instance: usize,
    state: CellState,
    parts: Option<Arc<Mutex<TablePartition>>>,
    replied: bool,
}

impl OpenLoopInsert {
    /// Build an insert cell for a routed batch.
    pub fn new(
        shuttle: Arc<Shuttle<usize>>,
        table: Arc<Table>,
        rows: Vec<InsertRow>,
        instance: usize,
    ) -> Self {
        Self {
            table,
            rows,
            shuttle,
            instance,
            state: CellState::Running,
            parts: None,
            replied: false,
        }
    }

    fn reply(&mut self, response: CellResponse<usize>) {
        if !self.replied {
            self.replied = true;
            self.shuttle.arrive(response);
        }
        self.state = CellState::Done;
    }
}

impl OpenLoop for OpenLoopInsert {
    fn owning_table(&self) -> &str {
        self.table.name()
    }

    fn state(&self) -> CellState {
        self.state
    }

    fn prepare(&mut self, ctx: &CellContext) {
        self.parts = Some(self.table.partition_or_create(ctx.partition));
    }

    fn run(&mut self, _ctx: &CellContext) -> bool {
        global_metrics().inc_cell_run("insert");
        let Some(parts) = self.parts.clone() else {
            self.reply(CellResponse::ok(self.instance, 0));
            return false;
        };

        let applied = {
            let mut parts = parts.lock();
            let rows = std::mem::take(&mut self.rows);
            let count = rows.len();
            for row in rows {
                for (hash, text) in &row.literals {
                    let interned = parts.intern(text);
                    debug_assert_eq!(interned, *hash);
                }
                let lin = parts.upsert_actor(row.id_hash, row.id_string.as_deref());
                parts.insert_event(
                    lin,
                    Event {
                        stamp: row.stamp,
                        values: row.values,
                    },
                );
            }
            count
        };

        self.reply(CellResponse::ok(self.instance, applied));
        false
    }

    fn partition_removed(&mut self) {
        self.reply(CellResponse::err(self.instance, partition_removed_error()));
    }
}

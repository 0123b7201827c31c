//! Person cell: single-actor drill-down, run only on the owning node's
//! owning partition. Replies with a JSON dump of the actor's event grid.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use evq_common::{global_metrics, unscale_double, EvqError};

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::cells::partition_removed_error;
use crate::partition::TablePartition;
use crate::shuttle::{CellResponse, Shuttle};
use crate::table::{ColumnType, Table};

/// Single-actor lookup cell.
pub struct OpenLoopPerson {
    table: Arc<Table>,
    uuid: i64,
    shuttle: Arc<Shuttle<Value>>,
    state: CellState,
    parts: Option<Arc<Mutex<TablePartition>>>,
    replied: bool,
}

impl OpenLoopPerson {
    /// Build a lookup for the hashed actor id.
    pub fn new(shuttle: Arc<Shuttle<Value>>, table: Arc<Table>, uuid: i64) -> Self {
        Self {
            table,
            uuid,
            shuttle,
            state: CellState::Running,
            parts: None,
            replied: false,
        }
    }

    fn reply(&mut self, response: CellResponse<Value>) {
        if !self.replied {
            self.replied = true;
            self.shuttle.arrive(response);
        }
        self.state = CellState::Done;
    }
}

impl OpenLoop for OpenLoopPerson {
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
        global_metrics().inc_cell_run("person");
        let Some(parts) = self.parts.clone() else {
            self.reply(CellResponse::err(
                0,
                EvqError::query("person could not be found"),
            ));
            return false;
        };

        let dump = {
            let parts = parts.lock();
            let schema = self.table.schema();
            parts.actor_by_hash(self.uuid).map(|actor| {
                let events: Vec<Value> = actor
                    .events
                    .iter()
                    .map(|event| {
                        let mut values = Map::new();
                        for (column_index, raw) in &event.values {
                            let Some(column) = schema.columns().get(*column_index) else {
                                continue;
                            };
                            let rendered = match column.kind {
                                ColumnType::Int => json!(raw),
                                ColumnType::Double => json!(unscale_double(*raw)),
                                ColumnType::Bool => json!(*raw != 0),
                                ColumnType::Text => parts
                                    .literal(*raw)
                                    .map(|t| Value::String(t.to_string()))
                                    .unwrap_or_else(|| json!(raw)),
                            };
                            values.insert(column.name.clone(), rendered);
                        }
                        json!({ "stamp": event.stamp, "values": values })
                    })
                    .collect();
                json!({
                    "id": actor.id_hash,
                    "id_string": actor.id_string,
                    "event_count": actor.events.len(),
                    "events": events,
                })
            })
        };

        match dump {
            Some(body) => self.reply(CellResponse::ok(0, body)),
            None => self.reply(CellResponse::err(
                0,
                EvqError::query("person could not be found"),
            )),
        }
        false
    }

    fn partition_removed(&mut self) {
        self.reply(CellResponse::err(0, partition_removed_error()));
    }
}

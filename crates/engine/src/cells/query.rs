//! Event-query cell: evaluates a compiled query against every actor in
//! its partition, writing grouped rows into the per-worker result buffer.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use evq_common::{global_metrics, EvqError};
use evq_result::ResultSet;

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::cells::{member_of, missing_segment, partition_removed_error, SetSink, SLICE_ACTORS};
use crate::partition::TablePartition;
use crate::query::{ActorView, CompiledQuery};
use crate::shuttle::{CellResponse, Shuttle};
use crate::table::Table;

/// Per-partition executor for an event query.
pub struct OpenLoopQuery {
    table: Arc<Table>,
    macros: CompiledQuery,
    shuttle: Arc<Shuttle<()>>,
    result: Arc<Mutex<ResultSet>>,
    instance: usize,
    state: CellState,
    parts: Option<Arc<Mutex<TablePartition>>>,
    cursor: usize,
    max_lin: usize,
    replied: bool,
}

impl OpenLoopQuery {
    /// Build a cell bound to the worker's result buffer slot.
    pub fn new(
        shuttle: Arc<Shuttle<()>>,
        table: Arc<Table>,
        macros: CompiledQuery,
        result: Arc<Mutex<ResultSet>>,
        instance: usize,
    ) -> Self {
        Self {
            table,
            macros,
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

impl OpenLoop for OpenLoopQuery {
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
            missing_segment(&guard, &self.macros.segments)
        };
        if let Some(name) = missing {
            self.reply_err(EvqError::query(format!("missing segment '{name}'")));
            return;
        }
        self.parts = Some(parts);
        debug!(
            table = %self.table.name(),
            partition = %ctx.partition,
            population = self.max_lin,
            "query cell prepared"
        );
    }

    fn run(&mut self, _ctx: &CellContext) -> bool {
        global_metrics().inc_cell_run("query");
        let Some(parts) = self.parts.clone() else {
            self.reply_ok();
            return false;
        };
        let sets: Vec<String> = if self.macros.segments.is_empty() {
            vec!["*".to_string()]
        } else {
            self.macros.segments.clone()
        };

        let outcome = {
            let parts = parts.lock();
            let mut result = self.result.lock();
            let end = (self.cursor + SLICE_ACTORS).min(self.max_lin);
            let mut failure = None;
            while self.cursor < end {
                let lin = self.cursor;
                self.cursor += 1;
                let Some(actor) = parts.actor_by_lin(lin) else {
                    continue;
                };
                let view = ActorView {
                    actor,
                    partition: &parts,
                    session_time_ms: self.macros.session_time_ms,
                };
                for (set_index, segment) in sets.iter().enumerate() {
                    if !member_of(&parts, segment, lin) {
                        continue;
                    }
                    let mut sink = SetSink {
                        set: &mut result,
                        set_index,
                    };
                    if let Err(e) = self.macros.program.exec(&view, &mut sink) {
                        failure = Some(e);
                        break;
                    }
                }
                if failure.is_some() {
                    break;
                }
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(self.cursor >= self.max_lin),
            }
        };

        // locks released: replying may fire the shuttle completion,
        // which merges these same buffers
        match outcome {
            Err(e) => {
                self.reply_err(e);
                false
            }
            Ok(true) => {
                self.reply_ok();
                false
            }
            Ok(false) => true,
        }
    }

    fn partition_removed(&mut self) {
        self.reply_err(partition_removed_error());
    }
}

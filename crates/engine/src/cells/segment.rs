//! Segment cell: evaluates one or more `@segment` predicates over every
//! actor, commits the membership bits to the partition, and tallies a
//! member count per segment.

use std::sync::Arc;

use parking_lot::Mutex;

use evq_common::{global_metrics, hash_bytes, EvqError};
use evq_result::{ResultSet, RowKey};

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::cells::{partition_removed_error, SLICE_ACTORS};
use crate::partition::{SegmentBits, TablePartition};
use crate::query::{ActorView, CompiledQuery};
use crate::shuttle::{CellResponse, Shuttle};
use crate::table::Table;

/// Per-partition executor for a batch of compiled `@segment` sections.
pub struct OpenLoopSegment {
    table: Arc<Table>,
    queries: Vec<(String, CompiledQuery)>,
    shuttle: Arc<Shuttle<()>>,
    result: Arc<Mutex<ResultSet>>,
    instance: usize,
    state: CellState,
    parts: Option<Arc<Mutex<TablePartition>>>,
    query_at: usize,
    cursor: usize,
    max_lin: usize,
    bits: Vec<bool>,
    members: usize,
    replied: bool,
}

impl OpenLoopSegment {
    /// Build a cell evaluating `queries` in order.
    pub fn new(
        shuttle: Arc<Shuttle<()>>,
        table: Arc<Table>,
        queries: Vec<(String, CompiledQuery)>,
        result: Arc<Mutex<ResultSet>>,
        instance: usize,
    ) -> Self {
        Self {
            table,
            queries,
            shuttle,
            result,
            instance,
            state: CellState::Running,
            parts: None,
            query_at: 0,
            cursor: 0,
            max_lin: 0,
            bits: Vec::new(),
            members: 0,
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

impl OpenLoop for OpenLoopSegment {
    fn owning_table(&self) -> &str {
        self.table.name()
    }

    fn state(&self) -> CellState {
        self.state
    }

    fn prepare(&mut self, ctx: &CellContext) {
        let parts = self.table.partition_or_create(ctx.partition);
        self.max_lin = parts.lock().actor_count();
        self.bits = vec![false; self.max_lin];
        self.parts = Some(parts);
        if self.queries.is_empty() {
            self.reply_ok();
        }
    }

    fn run(&mut self, _ctx: &CellContext) -> bool {
        global_metrics().inc_cell_run("segment");
        let Some(parts) = self.parts.clone() else {
            self.reply_ok();
            return false;
        };

        let outcome = {
            let mut parts = parts.lock();
            let (name, macros) = &self.queries[self.query_at];
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
                    session_time_ms: macros.session_time_ms,
                };
                match macros.program.exec_predicate(&view) {
                    Ok(member) => {
                        self.bits[lin] = member;
                        if member {
                            self.members += 1;
                        }
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if failure.is_none() && self.cursor >= self.max_lin {
                // this segment is complete: commit bits and tally count
                parts.commit_segment(
                    name,
                    SegmentBits {
                        bits: std::mem::take(&mut self.bits),
                    },
                );
                let key_hash = hash_bytes(name.as_bytes());
                let mut result = self.result.lock();
                result.add_literal(key_hash, name.clone());
                result.apply(&RowKey::single(key_hash), 0, 0, self.members as i64);
                drop(result);

                self.query_at += 1;
                self.cursor = 0;
                self.members = 0;
                self.bits = vec![false; self.max_lin];
            }

            match failure {
                Some(e) => Err(e),
                None => Ok(self.query_at >= self.queries.len()),
            }
        };

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

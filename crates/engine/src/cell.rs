//! Resumable unit of work bound to one partition.
//!
//! A cell lives on exactly one list of its partition's [`AsyncLoop`]
//! (queued xor active) until it reports [`CellState::Done`], at which
//! point the loop drops it within the same run step. Between calls a
//! cell must not block on I/O or on locks held by peer cells; long scans
//! yield by returning from `run`.
//!
//! [`AsyncLoop`]: crate::async_loop::AsyncLoop

use evq_common::{PartitionId, WorkerId};

/// Lifecycle state reported by a cell after `prepare`/`run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    /// The cell has more work; keep it on the active list.
    Running,
    /// The cell is finished; the loop deletes it this round.
    Done,
}

/// Execution context handed to a cell by its owning worker.
#[derive(Debug, Clone, Copy)]
pub struct CellContext {
    /// Partition this cell is bound to.
    pub partition: PartitionId,
    /// Worker thread executing the cell (indexes per-worker buffers).
    pub worker: WorkerId,
    /// Wall clock at the start of this visit, unix milliseconds.
    pub now: i64,
}

/// A resumable task scheduled cooperatively on one partition.
pub trait OpenLoop: Send {
    /// Table this cell belongs to; used by table-scoped purges.
    fn owning_table(&self) -> &str;

    /// Current lifecycle state.
    fn state(&self) -> CellState;

    /// Earliest timestamp at which the cell may resume (0 = immediately).
    fn run_at(&self) -> i64 {
        0
    }

    /// Cell-supplied gate checked before every visit.
    fn check_condition(&self) -> bool {
        true
    }

    /// One-time setup, invoked on the owning worker thread before the
    /// first `run`. May transition the cell to `Done`.
    fn prepare(&mut self, ctx: &CellContext);

    /// One cooperative slice. Returns true when the cell wants an
    /// immediate re-run (the worker loops again without sleeping).
    fn run(&mut self, ctx: &CellContext) -> bool;

    /// Best-effort cancellation: the partition is being dropped. The
    /// cell must complete any outstanding fan-in arrival exactly once
    /// and must not double-complete if it already replied.
    fn partition_removed(&mut self);
}

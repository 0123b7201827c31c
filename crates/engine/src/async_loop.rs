//! Cooperative run loop for one partition.
//!
//! All cells bound to a partition execute on that partition's single
//! owning worker thread. Producers on any thread append to the `queued`
//! list under a lock; the owner splices `queued` into its private
//! `active` list at the top of each round and visits cells FIFO. There
//! is no priority queue; fairness is round-robin per round.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use evq_common::{now_ms, PartitionId, WorkerId};

use crate::cell::{CellContext, CellState, OpenLoop};
use crate::pool::WorkerSignal;

struct CellEntry {
    prepared: bool,
    cell: Box<dyn OpenLoop>,
}

/// Per-partition scheduler state.
pub struct AsyncLoop {
    partition: PartitionId,
    worker: WorkerId,
    queued: Mutex<Vec<CellEntry>>,
    queue_size: AtomicUsize,
    /// Table names whose cells must be cancelled; drained by the owner
    /// at the top of the next round so `partition_removed` always runs
    /// on the owning thread.
    purges: Mutex<Vec<String>>,
    signal: Arc<WorkerSignal>,
    active: Mutex<Vec<CellEntry>>,
}

impl AsyncLoop {
    pub(crate) fn new(partition: PartitionId, worker: WorkerId, signal: Arc<WorkerSignal>) -> Self {
        Self {
            partition,
            worker,
            queued: Mutex::new(Vec::new()),
            queue_size: AtomicUsize::new(0),
            purges: Mutex::new(Vec::new()),
            signal,
            active: Mutex::new(Vec::new()),
        }
    }

    /// Partition this loop owns.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Worker thread this loop is bound to.
    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    /// Accept a cell from any thread and wake the owning worker.
    pub fn queue_cell(&self, cell: Box<dyn OpenLoop>) {
        {
            let mut queued = self.queued.lock();
            queued.push(CellEntry {
                prepared: false,
                cell,
            });
        }
        self.queue_size.fetch_add(1, Ordering::Release);
        self.signal.trigger();
    }

    /// Cells waiting to be spliced into the active list.
    pub fn queued_len(&self) -> usize {
        self.queue_size.load(Ordering::Acquire)
    }

    /// Request cancellation of every cell owned by `table`. Executed by
    /// the owning worker at the top of its next round; wakes the worker
    /// so stalled shuttles complete promptly.
    pub fn purge_by_table(&self, table: &str) {
        self.purges.lock().push(table.to_string());
        self.signal.trigger();
    }

    /// Cancel everything on both lists (partition dropped / shutdown).
    /// Called from the owning worker.
    pub(crate) fn release(&self) {
        let mut dropped: Vec<CellEntry> = Vec::new();
        {
            let mut queued = self.queued.lock();
            self.queue_size.fetch_sub(queued.len(), Ordering::Release);
            dropped.append(&mut queued);
        }
        dropped.append(&mut self.active.lock());
        for mut entry in dropped {
            entry.cell.partition_removed();
        }
    }

    fn drain_purges(&self, active: &mut Vec<CellEntry>) {
        let purges = std::mem::take(&mut *self.purges.lock());
        if purges.is_empty() {
            return;
        }
        let matches = |cell: &dyn OpenLoop| purges.iter().any(|t| t == cell.owning_table());
        {
            let mut queued = self.queued.lock();
            let mut keep = Vec::with_capacity(queued.len());
            for mut entry in queued.drain(..) {
                if matches(entry.cell.as_ref()) {
                    self.queue_size.fetch_sub(1, Ordering::Release);
                    entry.cell.partition_removed();
                } else {
                    keep.push(entry);
                }
            }
            *queued = keep;
        }
        let mut keep = Vec::with_capacity(active.len());
        for mut entry in active.drain(..) {
            if matches(entry.cell.as_ref()) {
                entry.cell.partition_removed();
            } else {
                keep.push(entry);
            }
        }
        *active = keep;
    }

    /// One round over the active list. Called only by the owning worker.
    ///
    /// Returns whether any cell asked for an immediate re-run; updates
    /// `next_run` (unix ms, -1 = none) with the earliest future resume
    /// time among still-running cells.
    pub fn run(&self, next_run: &mut i64) -> bool {
        let mut active = self.active.lock();
        self.drain_purges(&mut active);

        // inject queued work; a cell spawned by another cell lands on
        // the next cycle
        if self.queue_size.load(Ordering::Acquire) > 0 {
            let mut queued = self.queued.lock();
            self.queue_size.fetch_sub(queued.len(), Ordering::Release);
            active.append(&mut queued);
        }

        if active.is_empty() {
            return false;
        }

        let mut run_count = 0_usize;
        let mut rerun = Vec::with_capacity(active.len());

        for mut entry in active.drain(..) {
            let now = now_ms();
            let ready = entry.cell.check_condition()
                && now >= entry.cell.run_at()
                && entry.cell.state() == CellState::Running;

            if ready {
                if !entry.prepared {
                    let ctx = CellContext {
                        partition: self.partition,
                        worker: self.worker,
                        now,
                    };
                    entry.cell.prepare(&ctx);
                    entry.prepared = true;
                    // completed or bailed during prepare: do not run
                    if entry.cell.state() == CellState::Done {
                        continue;
                    }
                }

                let ctx = CellContext {
                    partition: self.partition,
                    worker: self.worker,
                    now,
                };
                if entry.cell.run(&ctx) {
                    run_count += 1;
                }

                if entry.cell.state() == CellState::Running {
                    let run_at = entry.cell.run_at();
                    if run_at > now && (*next_run == -1 || run_at < *next_run) {
                        *next_run = run_at;
                    }
                }
            }

            if entry.cell.state() == CellState::Done {
                debug!(
                    partition = %self.partition,
                    table = entry.cell.owning_table(),
                    "cell completed"
                );
            } else {
                rerun.push(entry);
            }
        }

        *active = rerun;
        run_count > 0
    }
}

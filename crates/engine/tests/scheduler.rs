//! Scheduler behavior: cell lifecycle, timer gating, FIFO fairness,
//! purge cancellation, and worker/partition binding.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use evq_common::{now_ms, PartitionId};
use evq_engine::{
    AsyncPool, CellContext, CellResponse, CellState, OpenLoop, Shuttle,
};

/// Counts runs, completes after `target` visits, optionally delayed.
struct CountingCell {
    table: String,
    state: CellState,
    run_at: i64,
    target: usize,
    runs: Arc<AtomicUsize>,
    prepares: Arc<AtomicUsize>,
    first_run_at_ms: Arc<AtomicI64>,
    order: Option<(Arc<Mutex<Vec<usize>>>, usize)>,
    shuttle: Option<Arc<Shuttle<()>>>,
    replied: bool,
}

impl CountingCell {
    fn new(target: usize) -> Self {
        Self {
            table: "t".to_string(),
            state: CellState::Running,
            run_at: 0,
            target,
            runs: Arc::new(AtomicUsize::new(0)),
            prepares: Arc::new(AtomicUsize::new(0)),
            first_run_at_ms: Arc::new(AtomicI64::new(0)),
            order: None,
            shuttle: None,
            replied: false,
        }
    }
}

impl OpenLoop for CountingCell {
    fn owning_table(&self) -> &str {
        &self.table
    }

    fn state(&self) -> CellState {
        self.state
    }

    fn run_at(&self) -> i64 {
        self.run_at
    }

    fn prepare(&mut self, _ctx: &CellContext) {
        self.prepares.fetch_add(1, Ordering::SeqCst);
    }

    fn run(&mut self, _ctx: &CellContext) -> bool {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            self.first_run_at_ms.store(now_ms(), Ordering::SeqCst);
            if let Some((order, tag)) = &self.order {
                order.lock().push(*tag);
            }
        }
        if n >= self.target {
            if let Some(shuttle) = &self.shuttle {
                if !self.replied {
                    self.replied = true;
                    shuttle.arrive(CellResponse::ok(0, ()));
                }
            }
            self.state = CellState::Done;
            return false;
        }
        true
    }

    fn partition_removed(&mut self) {
        if let Some(shuttle) = &self.shuttle {
            if !self.replied {
                self.replied = true;
                shuttle.arrive(CellResponse::err(
                    0,
                    evq_common::EvqError::query("partition removed"),
                ));
            }
        }
        self.state = CellState::Done;
    }
}

fn wait_until(deadline: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    probe()
}

#[test]
fn cell_runs_until_done_and_prepares_once() {
    let pool = AsyncPool::start(4, 2);
    let cell = CountingCell::new(5);
    let runs = Arc::clone(&cell.runs);
    let prepares = Arc::clone(&cell.prepares);

    pool.get_partition(PartitionId(1))
        .expect("partition in range")
        .queue_cell(Box::new(cell));

    assert!(wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) == 5
    }));
    // done cells are deleted in the round that observed the state
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 5);
    assert_eq!(prepares.load(Ordering::SeqCst), 1);
    pool.shutdown();
}

#[test]
fn scheduled_cells_do_not_run_early() {
    let pool = AsyncPool::start(2, 1);
    let mut cell = CountingCell::new(1);
    let delay_ms = 250_i64;
    let queued_at = now_ms();
    cell.run_at = queued_at + delay_ms;
    let first_run = Arc::clone(&cell.first_run_at_ms);

    pool.get_partition(PartitionId(0))
        .expect("partition in range")
        .queue_cell(Box::new(cell));

    assert!(wait_until(Duration::from_secs(5), || {
        first_run.load(Ordering::SeqCst) != 0
    }));
    assert!(first_run.load(Ordering::SeqCst) >= queued_at + delay_ms);
    pool.shutdown();
}

#[test]
fn cells_first_run_in_fifo_order() {
    let pool = AsyncPool::start(1, 1);
    let order = Arc::new(Mutex::new(Vec::new()));
    let l = pool.get_partition(PartitionId(0)).expect("partition");
    let mut runs = Vec::new();
    for tag in 0..4 {
        let mut cell = CountingCell::new(3);
        cell.order = Some((Arc::clone(&order), tag));
        runs.push(Arc::clone(&cell.runs));
        l.queue_cell(Box::new(cell));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        runs.iter().all(|r| r.load(Ordering::SeqCst) == 3)
    }));
    assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    pool.shutdown();
}

#[test]
fn purge_completes_shuttle_exactly_once() {
    let pool = AsyncPool::start(2, 1);
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_in = Arc::clone(&fired);
    let shuttle = Arc::new(Shuttle::new(1, move |responses: Vec<CellResponse<()>>| {
        assert_eq!(responses.len(), 1);
        assert!(responses[0].error.is_some());
        fired_in.fetch_add(1, Ordering::SeqCst);
    }));

    // a cell that never completes on its own
    let mut cell = CountingCell::new(usize::MAX);
    cell.shuttle = Some(Arc::clone(&shuttle));
    let runs = Arc::clone(&cell.runs);

    let l = pool.get_partition(PartitionId(0)).expect("partition");
    l.queue_cell(Box::new(cell));
    assert!(wait_until(Duration::from_secs(5), || {
        runs.load(Ordering::SeqCst) > 0
    }));

    l.purge_by_table("t");
    assert!(wait_until(Duration::from_secs(5), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    // a second purge must not double-complete
    l.purge_by_table("t");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(shuttle.completed());
    pool.shutdown();
}

#[test]
fn cell_factory_places_one_cell_per_partition() {
    let pool = AsyncPool::start(8, 3);
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.partition_max(), 8);

    let placed = Arc::new(Mutex::new(Vec::new()));
    let partitions: Vec<PartitionId> = (0..8).map(PartitionId).collect();
    let runs: Arc<Mutex<Vec<Arc<AtomicUsize>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let placed = Arc::clone(&placed);
        let runs = Arc::clone(&runs);
        pool.cell_factory(&partitions, |l| {
            placed.lock().push((l.partition(), l.worker_id()));
            let cell = CountingCell::new(1);
            runs.lock().push(Arc::clone(&cell.runs));
            Box::new(cell)
        });
    }

    let placed = placed.lock().clone();
    assert_eq!(placed.len(), 8);
    for (partition, worker) in &placed {
        assert_eq!(worker.0, partition.0 as usize % 3);
    }
    assert!(wait_until(Duration::from_secs(5), || {
        runs.lock().iter().all(|r| r.load(Ordering::SeqCst) == 1)
    }));
    pool.shutdown();
}

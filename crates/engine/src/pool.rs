//! Fixed worker pool: W OS threads, each owning the loops of a disjoint
//! partition subset (`worker = partition mod W`).
//!
//! A worker sleeps on its condvar until a producer enqueues a cell on
//! one of its loops (immediate wake) or its earliest `run_at` elapses
//! (timed wake). On wake it runs every owned loop until no loop reports
//! progress, then re-sleeps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use evq_common::{now_ms, PartitionId, WorkerId};

use crate::async_loop::AsyncLoop;
use crate::cell::OpenLoop;

/// Default idle sleep when no cell has a scheduled resume time.
const IDLE_SLEEP_MS: u64 = 100;

/// Wakeup channel between producers and one worker thread.
pub struct WorkerSignal {
    triggered: Mutex<bool>,
    condvar: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            triggered: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Wake the worker immediately.
    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock();
        *triggered = true;
        self.condvar.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut triggered = self.triggered.lock();
        if !*triggered {
            self.condvar.wait_for(&mut triggered, timeout);
        }
        *triggered = false;
    }
}

/// Owns the worker threads and the partition-to-loop table.
pub struct AsyncPool {
    loops: Vec<Arc<AsyncLoop>>,
    signals: Vec<Arc<WorkerSignal>>,
    worker_count: usize,
    partition_max: u32,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncPool {
    /// Create loops for every partition and start `worker_count` threads.
    pub fn start(partition_max: u32, worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let signals: Vec<Arc<WorkerSignal>> =
            (0..worker_count).map(|_| Arc::new(WorkerSignal::new())).collect();

        let loops: Vec<Arc<AsyncLoop>> = (0..partition_max)
            .map(|p| {
                let worker = (p as usize) % worker_count;
                Arc::new(AsyncLoop::new(
                    PartitionId(p),
                    WorkerId(worker),
                    Arc::clone(&signals[worker]),
                ))
            })
            .collect();

        let running = Arc::new(AtomicBool::new(true));
        let pool = Arc::new(Self {
            loops,
            signals,
            worker_count,
            partition_max,
            running: Arc::clone(&running),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let pool_ref = Arc::clone(&pool);
            let handle = std::thread::Builder::new()
                .name(format!("evq-worker-{worker}"))
                .spawn(move || pool_ref.worker_main(worker))
                .expect("spawn worker thread");
            handles.push(handle);
        }
        *pool.workers.lock() = handles;
        info!(worker_count, partition_max, "async pool started");
        pool
    }

    fn worker_main(&self, worker: usize) {
        let signal = Arc::clone(&self.signals[worker]);
        let my_loops: Vec<Arc<AsyncLoop>> = self
            .loops
            .iter()
            .filter(|l| l.worker_id().0 == worker)
            .cloned()
            .collect();
        debug!(worker, partitions = my_loops.len(), "worker online");

        while self.running.load(Ordering::Acquire) {
            let mut next_run = -1_i64;
            let mut progress = false;
            for l in &my_loops {
                progress |= l.run(&mut next_run);
            }
            if progress {
                continue;
            }
            let timeout = if next_run >= 0 {
                Duration::from_millis((next_run - now_ms()).max(1) as u64)
            } else {
                Duration::from_millis(IDLE_SLEEP_MS)
            };
            signal.wait(timeout);
        }

        for l in &my_loops {
            l.release();
        }
    }

    /// Worker thread count (`W`).
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Total partition count (`P`).
    pub fn partition_max(&self) -> u32 {
        self.partition_max
    }

    /// Loop owning `partition`, if the id is in range.
    pub fn get_partition(&self, partition: PartitionId) -> Option<&Arc<AsyncLoop>> {
        self.loops.get(partition.0 as usize)
    }

    /// For each partition in `partitions`, build a cell with `factory`
    /// and enqueue it on that partition's loop. The factory receives the
    /// loop so it can index per-worker result buffers by worker id.
    pub fn cell_factory(
        &self,
        partitions: &[PartitionId],
        mut factory: impl FnMut(&AsyncLoop) -> Box<dyn OpenLoop>,
    ) {
        for partition in partitions {
            if let Some(l) = self.get_partition(*partition) {
                let cell = factory(l);
                l.queue_cell(cell);
            }
        }
    }

    /// Cancel every cell owned by `table` on every partition.
    pub fn purge_by_table(&self, table: &str) {
        for l in &self.loops {
            l.purge_by_table(table);
        }
    }

    /// Stop workers and cancel outstanding cells.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for s in &self.signals {
            s.trigger();
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            let _ = h.join();
        }
    }
}

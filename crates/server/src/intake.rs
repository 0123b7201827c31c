//! Intake queues and the sync worker pools behind the listener.
//!
//! Two lanes: `query` for non-fork `/v1/query/*` GET/POSTs, `other` for
//! everything else, including fork POSTs, which deliberately bypass the
//! query lane so an originator's self-dispatch cannot deadlock behind
//! its own admission slot. Query workers additionally gate on a hard
//! cap of concurrently running queries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use evq_common::global_metrics;

use crate::message::MessagePtr;

/// Handler invoked for each dequeued message on a pool thread.
pub type Dispatcher = Arc<dyn Fn(MessagePtr) + Send + Sync>;

struct QueryLane {
    queue: VecDeque<MessagePtr>,
    running: usize,
}

/// The two intake lanes plus their worker pools.
pub struct Intake {
    query: Mutex<QueryLane>,
    query_ready: Condvar,
    other: Mutex<VecDeque<MessagePtr>>,
    other_ready: Condvar,
    max_running_queries: usize,
    dispatcher: Dispatcher,
    running: AtomicBool,
}

impl Intake {
    /// Start `query_workers` + `other_workers` pool threads feeding
    /// `dispatcher`.
    pub fn start(
        query_workers: usize,
        other_workers: usize,
        max_running_queries: usize,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        let intake = Arc::new(Self {
            query: Mutex::new(QueryLane {
                queue: VecDeque::new(),
                running: 0,
            }),
            query_ready: Condvar::new(),
            other: Mutex::new(VecDeque::new()),
            other_ready: Condvar::new(),
            max_running_queries: max_running_queries.max(1),
            dispatcher,
            running: AtomicBool::new(true),
        });

        for i in 0..other_workers.max(1) {
            let intake_ref = Arc::clone(&intake);
            std::thread::Builder::new()
                .name(format!("evq-http-other-{i}"))
                .spawn(move || intake_ref.other_runner())
                .expect("spawn intake worker");
        }
        for i in 0..query_workers.max(1) {
            let intake_ref = Arc::clone(&intake);
            std::thread::Builder::new()
                .name(format!("evq-http-query-{i}"))
                .spawn(move || intake_ref.query_runner())
                .expect("spawn intake worker");
        }
        info!(query_workers, other_workers, max_running_queries, "http intake started");
        intake
    }

    /// Enqueue on the query lane.
    pub fn queue_query_message(&self, message: MessagePtr) {
        let depth = {
            let mut lane = self.query.lock();
            lane.queue.push_back(message);
            lane.queue.len()
        };
        global_metrics().set_queue_depth("query", depth);
        self.query_ready.notify_one();
    }

    /// Enqueue on the other lane.
    pub fn queue_other_message(&self, message: MessagePtr) {
        let depth = {
            let mut queue = self.other.lock();
            queue.push_back(message);
            queue.len()
        };
        global_metrics().set_queue_depth("other", depth);
        self.other_ready.notify_one();
    }

    /// Currently admitted query count (test/observability hook).
    pub fn running_queries(&self) -> usize {
        self.query.lock().running
    }

    /// Stop the pool threads.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.query_ready.notify_all();
        self.other_ready.notify_all();
    }

    fn query_runner(&self) {
        while self.running.load(Ordering::Acquire) {
            let message = {
                let mut lane = self.query.lock();
                while lane.queue.is_empty() || lane.running >= self.max_running_queries {
                    self.query_ready
                        .wait_for(&mut lane, Duration::from_millis(250));
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                }
                lane.running += 1;
                global_metrics().set_running_queries("self", lane.running);
                lane.queue.pop_front()
            };
            if let Some(message) = message {
                (self.dispatcher)(message);
            }
            let mut lane = self.query.lock();
            lane.running -= 1;
            global_metrics().set_running_queries("self", lane.running);
            drop(lane);
            // a freed admission slot may unblock a waiting peer
            self.query_ready.notify_one();
        }
    }

    fn other_runner(&self) {
        while self.running.load(Ordering::Acquire) {
            let message = {
                let mut queue = self.other.lock();
                while queue.is_empty() {
                    self.other_ready
                        .wait_for(&mut queue, Duration::from_millis(250));
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                }
                queue.pop_front()
            };
            if let Some(message) = message {
                (self.dispatcher)(message);
            }
        }
    }
}

/// Intake routing rule: non-fork `/v1/query/*` GET/POSTs take the query
/// lane; everything else (fork POSTs included) takes the other lane.
pub fn route_message(intake: &Intake, message: MessagePtr) {
    let is_query_path = message.path().starts_with("/v1/query/");
    let is_query_method = matches!(message.method(), "GET" | "POST");
    if is_query_path && is_query_method && !message.param_bool("fork") {
        intake.queue_query_message(message);
    } else {
        intake.queue_other_message(message);
    }
}

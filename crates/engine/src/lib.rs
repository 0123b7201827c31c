//! Partition scheduler, worker pool, resumable cells, and the in-memory
//! event grid.
//!
//! Architecture role:
//! - two-tier scheduling: OS-thread parallelism between workers,
//!   cooperative single-threaded execution within a worker
//! - partition-local state is touched only by its owning worker, so the
//!   aggregation hot path takes no contended locks
//! - the [`Shuttle`] fan-in barrier is the single completion edge for a
//!   request's per-partition cells
//!
//! Key modules:
//! - [`async_loop`] / [`pool`] - the scheduler
//! - [`cell`] / [`cells`] - the resumable task contract and roles
//! - [`shuttle`] - fan-in
//! - [`table`] / [`partition`] - tables, schemas, event grids
//! - [`query`] - the compiled-query seam

pub mod async_loop;
pub mod cell;
pub mod cells;
pub mod partition;
pub mod pool;
pub mod query;
pub mod shuttle;
pub mod table;

pub use async_loop::AsyncLoop;
pub use cell::{CellContext, CellState, OpenLoop};
pub use cells::{
    ColumnQueryConfig, ColumnQueryMode, InsertRow, OpenLoopColumn, OpenLoopHistogram,
    OpenLoopInsert, OpenLoopPerson, OpenLoopQuery, OpenLoopSegment,
};
pub use partition::{Actor, Event, SegmentBits, TablePartition};
pub use pool::AsyncPool;
pub use query::{
    ActorProgram, ActorView, CompiledQuery, Marshal, ParamValue, ParamVars, QueryCompiler,
    TallySink,
};
pub use shuttle::{CellResponse, Shuttle};
pub use table::{Column, ColumnType, Database, SegmentDef, Table, TableSchema};

//! Cell roles: query, segment, column, histogram, person, insert.
//!
//! All roles share the lifecycle contract in [`crate::cell`]: prepare
//! mounts the partition objects, `run` scans a bounded slice of actors
//! per visit and asks for an immediate re-run until the scan completes,
//! completion replies through the shuttle exactly once, and
//! `partition_removed` replies with a synthetic retry error so the
//! shuttle never stalls.
//!
//! Every cell must release its partition/result locks before touching
//! the shuttle: the final arrival runs the completion callback on the
//! arriving thread, and that callback locks the same result buffers.

mod column;
mod histogram;
mod insert;
mod person;
mod query;
mod segment;

pub use column::{ColumnQueryConfig, ColumnQueryMode, OpenLoopColumn};
pub use histogram::OpenLoopHistogram;
pub use insert::{InsertRow, OpenLoopInsert};
pub use person::OpenLoopPerson;
pub use query::OpenLoopQuery;
pub use segment::OpenLoopSegment;

use evq_result::{ResultSet, RowKey};

use crate::partition::TablePartition;
use crate::query::TallySink;

/// Actors visited per `run` slice before yielding to peer cells.
pub(crate) const SLICE_ACTORS: usize = 1024;

/// Synthetic error deposited when a partition is dropped mid-query.
pub(crate) fn partition_removed_error() -> evq_common::EvqError {
    evq_common::EvqError::query("partition removed during query - please retry")
}

/// Binds a tally sink to one segment set of a per-worker result buffer.
pub(crate) struct SetSink<'a> {
    pub set: &'a mut ResultSet,
    pub set_index: usize,
}

impl TallySink for SetSink<'_> {
    fn tally(&mut self, key: &RowKey, column: usize, value: i64) {
        self.set.apply(key, column, self.set_index, value);
    }

    fn intern(&mut self, hash: i64, text: &str) {
        self.set.add_literal(hash, text);
    }
}

/// Membership of `lin` in the named segment; `*` is the whole population.
pub(crate) fn member_of(parts: &TablePartition, segment: &str, lin: usize) -> bool {
    if segment == "*" {
        return true;
    }
    parts
        .segment(segment)
        .map(|bits| bits.is_member(lin))
        .unwrap_or(false)
}

/// First referenced segment missing from this partition, if any.
pub(crate) fn missing_segment(parts: &TablePartition, segments: &[String]) -> Option<String> {
    segments
        .iter()
        .find(|s| s.as_str() != "*" && !parts.has_segment(s))
        .cloned()
}

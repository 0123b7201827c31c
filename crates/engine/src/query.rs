//! The compiled-query seam.
//!
//! The scripting language, parser, and compiler are external
//! collaborators: they produce an opaque [`CompiledQuery`] bound to a
//! table schema. The engine only needs the output column shape, the
//! referenced segments/marshals, and the three program entry points.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evq_common::{EvqError, Result};
use evq_result::{ColumnDescriptor, RowKey};

use crate::partition::{Actor, TablePartition};
use crate::table::TableSchema;

/// Typed inline script parameter (`str_x=`, `int_x=`, `dbl_x=`, `bool_x=`).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// String parameter.
    Str(String),
    /// Integer parameter.
    Int(i64),
    /// Double parameter (scaled at use sites, not here).
    Dbl(f64),
    /// Boolean parameter.
    Bool(bool),
}

/// Inline parameter overrides keyed by bare name.
pub type ParamVars = HashMap<String, ParamValue>;

/// Marshals (runtime intrinsics) a compiled script references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marshal {
    /// `tally(...)` - writes grouped rows.
    Tally,
    /// `return ...` - yields one scalar per actor.
    Return,
}

/// Read-only view of one actor handed to a program execution.
pub struct ActorView<'a> {
    /// The actor under evaluation.
    pub actor: &'a Actor,
    /// Partition store, for literal lookups.
    pub partition: &'a TablePartition,
    /// Effective session gap for this query.
    pub session_time_ms: i64,
}

impl ActorView<'_> {
    /// Number of sessions under the effective gap.
    pub fn session_count(&self) -> usize {
        self.actor.sessions(self.session_time_ms).len()
    }
}

/// Row sink a tally-mode program writes through. The engine binds the
/// sink to the caller's per-worker result buffer and segment set.
pub trait TallySink {
    /// Fold `value` into `(key, column)` under the column's reducer.
    fn tally(&mut self, key: &RowKey, column: usize, value: i64);
    /// Intern a text literal so group keys/cells render as text.
    fn intern(&mut self, hash: i64, text: &str);
}

/// Compiled per-actor program. One entry point per query mode; a
/// program only has to support the modes its script shape allows.
pub trait ActorProgram: Send + Sync {
    /// Tally mode: evaluate the actor and write rows through `sink`.
    fn exec(&self, view: &ActorView<'_>, sink: &mut dyn TallySink) -> Result<()> {
        let _ = (view, sink);
        Err(EvqError::query("script does not support tally execution"))
    }

    /// Histogram mode: yield one scalar for the actor, or `None` to
    /// skip it.
    fn exec_scalar(&self, view: &ActorView<'_>) -> Result<Option<i64>> {
        let _ = view;
        Err(EvqError::query("script does not support scalar execution"))
    }

    /// Segment mode: membership verdict for the actor.
    fn exec_predicate(&self, view: &ActorView<'_>) -> Result<bool> {
        let _ = view;
        Err(EvqError::query("script does not support predicate execution"))
    }
}

/// Opaque compiled-query value: schema-bound output shape plus the
/// program. Cheap to clone; the program is shared.
#[derive(Clone)]
pub struct CompiledQuery {
    /// Output column descriptors, in declaration order.
    pub columns: Vec<ColumnDescriptor>,
    /// Index expression count (wire set count alongside segments).
    pub index_count: usize,
    /// Segment names referenced by the query (`*` = whole population).
    pub segments: Vec<String>,
    /// Effective session gap in ms.
    pub session_time_ms: i64,
    /// True when compiled from an `@segment` section.
    pub is_segment: bool,
    /// Segment TTL in ms, when declared.
    pub segment_ttl_ms: Option<i64>,
    /// Segment refresh interval in ms, when declared.
    pub segment_refresh_ms: Option<i64>,
    /// Segment re-evaluates on ingest.
    pub on_insert: bool,
    /// Marshals the script references.
    pub marshals: HashSet<Marshal>,
    /// Compiler-emitted literals (hash → text) merged into results.
    pub literals: HashMap<i64, String>,
    /// The per-actor program.
    pub program: Arc<dyn ActorProgram>,
    /// Human-readable compiled form, returned by `debug=true`.
    pub dump: String,
}

impl std::fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("columns", &self.columns.len())
            .field("segments", &self.segments)
            .field("is_segment", &self.is_segment)
            .finish()
    }
}

impl CompiledQuery {
    /// Set count used when sizing result buffers: segments, floor 1.
    pub fn set_count(&self) -> usize {
        self.segments.len().max(1)
    }
}

/// External compiler contract: script text + schema + inline params in,
/// opaque compiled query out.
pub trait QueryCompiler: Send + Sync {
    /// Compile one script against a table schema.
    fn compile(
        &self,
        source: &str,
        schema: &TableSchema,
        params: &ParamVars,
    ) -> Result<CompiledQuery>;
}

//! Tables, schemas, the segment registry, and the database catalog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use evq_common::{EvqError, PartitionId, Result};

use crate::partition::TablePartition;
use crate::query::CompiledQuery;

/// Schema type of one table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit integer.
    Int,
    /// Double, stored as scaled fixed-point.
    Double,
    /// Boolean.
    Bool,
    /// Text, stored as hash + interned literal.
    Text,
}

/// One declared table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Position in the schema; also the grid value key.
    pub index: usize,
    /// Value type.
    pub kind: ColumnType,
}

/// Ordered, named column set for one table.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    /// Build a schema assigning indices in declaration order.
    pub fn new(columns: impl IntoIterator<Item = (impl Into<String>, ColumnType)>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(index, (name, kind))| Column {
                name: name.into(),
                index,
                kind,
            })
            .collect();
        Self { columns }
    }

    /// All columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// One registered segment definition: a named saved query with optional
/// TTL and refresh interval.
#[derive(Clone)]
pub struct SegmentDef {
    /// Segment name.
    pub name: String,
    /// Compiled query producing the membership predicate.
    pub macros: CompiledQuery,
    /// Time-to-live in ms; 0 = no expiry.
    pub ttl_ms: i64,
    /// Refresh interval in ms; 0 = no scheduled refresh.
    pub refresh_ms: i64,
    /// Re-evaluate membership on ingest of a member's events.
    pub on_insert: bool,
    /// Registration/update timestamp.
    pub last_modified: i64,
}

impl std::fmt::Debug for SegmentDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentDef")
            .field("name", &self.name)
            .field("ttl_ms", &self.ttl_ms)
            .field("refresh_ms", &self.refresh_ms)
            .field("on_insert", &self.on_insert)
            .finish()
    }
}

/// Named collection of actors plus its schema, segment registry, and
/// per-partition event grids.
pub struct Table {
    name: String,
    schema: RwLock<Arc<TableSchema>>,
    session_time_ms: AtomicI64,
    segments: Mutex<HashMap<String, SegmentDef>>,
    partitions: RwLock<HashMap<u32, Arc<Mutex<TablePartition>>>>,
}

impl Table {
    /// Create a table with the given schema and session-gap default.
    pub fn new(name: impl Into<String>, schema: TableSchema, session_time_ms: i64) -> Self {
        Self {
            name: name.into(),
            schema: RwLock::new(Arc::new(schema)),
            session_time_ms: AtomicI64::new(session_time_ms),
            segments: Mutex::new(HashMap::new()),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current schema snapshot.
    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read())
    }

    /// Replace the schema (writer's lock; reads are lock-free clones).
    pub fn set_schema(&self, schema: TableSchema) {
        *self.schema.write() = Arc::new(schema);
    }

    /// Session gap threshold in milliseconds.
    pub fn session_time_ms(&self) -> i64 {
        self.session_time_ms.load(Ordering::Relaxed)
    }

    /// Override the session gap threshold.
    pub fn set_session_time_ms(&self, ms: i64) {
        self.session_time_ms.store(ms, Ordering::Relaxed);
    }

    /// Register or replace a segment definition.
    pub fn register_segment(&self, def: SegmentDef) {
        info!(
            table = %self.name,
            segment = %def.name,
            ttl_ms = def.ttl_ms,
            refresh_ms = def.refresh_ms,
            "segment registered"
        );
        self.segments.lock().insert(def.name.clone(), def);
    }

    /// Registered segment definition by name.
    pub fn segment(&self, name: &str) -> Option<SegmentDef> {
        self.segments.lock().get(name).cloned()
    }

    /// Names of all registered segments.
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.lock().keys().cloned().collect()
    }

    /// Partition-local store, if it exists.
    pub fn partition(&self, partition: PartitionId) -> Option<Arc<Mutex<TablePartition>>> {
        self.partitions.read().get(&partition.0).cloned()
    }

    /// Partition-local store, created on first touch.
    pub fn partition_or_create(&self, partition: PartitionId) -> Arc<Mutex<TablePartition>> {
        if let Some(p) = self.partition(partition) {
            return p;
        }
        let mut parts = self.partitions.write();
        Arc::clone(
            parts
                .entry(partition.0)
                .or_insert_with(|| Arc::new(Mutex::new(TablePartition::new(partition)))),
        )
    }

    /// Drop one partition's local store (reassignment/table delete).
    pub fn drop_partition(&self, partition: PartitionId) {
        self.partitions.write().remove(&partition.0);
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

/// Catalog of tables on this node.
#[derive(Debug, Default)]
pub struct Database {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table by name.
    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Table by name or the canonical "table could not be found" error.
    pub fn get_or_err(&self, name: &str) -> Result<Arc<Table>> {
        self.get(name)
            .ok_or_else(|| EvqError::query("table could not be found"))
    }

    /// Register a table, replacing any previous definition.
    pub fn add(&self, table: Table) -> Arc<Table> {
        let table = Arc::new(table);
        self.tables
            .write()
            .insert(table.name().to_string(), Arc::clone(&table));
        table
    }

    /// Remove a table from the catalog. Callers must also purge its
    /// cells from the pool.
    pub fn remove(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.write().remove(name)
    }

    /// Names of all registered tables.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }
}

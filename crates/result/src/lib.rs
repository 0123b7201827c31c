//! Result buffers and the internode mux/demux codec.
//!
//! Architecture role:
//! - per-(worker, request) lockless aggregation buffers
//! - binary encoding of fork replies and demux back into buffers
//! - originator-side merge, sort, trim, and histogram fill

pub mod codec;
pub mod json;
pub mod result_set;

pub use codec::{internode_to_set, is_internode_blob, multi_set_to_internode, set_to_internode};
pub use json::{
    histogram_fill, merge_sets_to_json, sort_by_column, sort_by_key, trim, SortOrder, USE_OBSERVED,
};
pub use result_set::{
    merge_macro_literals, ColumnDescriptor, ColumnKind, Reducer, ResultSet, RowKey,
};

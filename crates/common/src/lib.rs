#![deny(missing_docs)]

//! Shared configuration, error types, ids, and observability primitives for EVQ crates.
//!
//! Architecture role:
//! - defines node/engine configuration passed across layers
//! - provides common [`EvqError`] / [`Result`] contracts
//! - hosts the stable sharding hash and fixed-point scaling rules
//! - hosts the metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`hashing`]
//! - [`ids`]
//! - [`metrics`]

/// Node and engine configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Stable sharding hash and fixed-point scaling.
pub mod hashing;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{NodeConfig, NodeEndpoint};
pub use error::{ErrorClass, ErrorCode, EvqError, Result};
pub use hashing::{
    hash_actor_id, hash_bytes, now_ms, partition_for, scale_double, unscale_double, DOUBLE_SCALE,
};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};

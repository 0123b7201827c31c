//! HTTP intake, admission control, and the fork/merge RPC handlers.
//!
//! Architecture role:
//! - converts HTTP requests into queued [`message::Message`]s
//! - two intake lanes with separate pools; hard cap on running queries
//! - the six query handlers plus insert, orchestrating fork fan-out on
//!   the originator and cell fan-out on each fork
//!
//! Key modules:
//! - [`intake`] / [`message`]
//! - [`rpc`]
//! - [`server`] - axum listener and the local-dispatch transport
//! - [`node`] - assembly

pub mod intake;
pub mod message;
pub mod node;
pub mod rpc;
pub mod server;
pub mod state;

pub use intake::{route_message, Intake};
pub use message::{Message, MessagePtr, Replier};
pub use node::boot;
pub use server::{app, parse_query, serve, serve_listener, LocalTransport};
pub use state::NodeRuntime;

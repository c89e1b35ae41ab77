//! flowsync library crate.
//!
//! Three-way reconciliation for graph-structured flow configurations: a
//! client's local edits and a server's independently advanced copy are
//! diffed against their shared base, conflicts are surfaced for an explicit
//! choice, and the resolved merge is committed back into the live store in
//! one step.
//!
//! The `flowsync` binary is a thin CLI over these modules; embedders drive
//! [`session::SyncSession`] directly.

pub mod codec;
pub mod config;
pub mod error;
pub mod history;
pub mod merge;
pub mod model;
pub mod registry;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use error::FlowError;

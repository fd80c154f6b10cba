//! trove - pluggable media discovery
//!
//! This library crate holds the pieces of the `trove` binary: config file
//! loading, the bundled sources and the bootstrap that wires them into a
//! registry and dispatcher. It is exposed for integration testing.

pub mod bootstrap;
pub mod config;
pub mod output;
pub mod sources;

pub use bootstrap::{bootstrap, bootstrap_with_ranks, Trove};

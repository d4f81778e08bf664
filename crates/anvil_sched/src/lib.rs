//! Worker-pool task scheduling with runtime-discovered dependencies.
//!
//! A [`Pool`] owns a fixed set of OS worker threads. [`Pool::map`] runs a
//! fallible function over a batch of items concurrently, returning results
//! in input order; [`Pool::map_with_dependencies`] first runs a discovery
//! pass that names each item's dependencies within the batch, then executes
//! respecting those edges, erroring on cycles before anything runs.
//!
//! Tasks may schedule further batches on the same pool from inside a task
//! without deadlocking, whatever the pool size.

#![warn(missing_docs)]

pub mod error;
pub mod graph;
pub mod pool;

pub use error::SchedError;
pub use graph::TaskGraph;
pub use pool::Pool;

//! Error types for scheduling operations.

use anvil_common::BuildError;

/// Errors surfaced by the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The discovered dependency graph is not acyclic.
    ///
    /// Every minimal cyclic group is reported together: a single item
    /// depending on itself, a mutually dependent pair, or a longer loop.
    /// Detected before execution starts, so a cyclic batch errors instead
    /// of hanging.
    #[error("dependency cycle(s) among tasks: {groups:?}")]
    Cycle {
        /// The cyclic groups, each listing the items involved.
        groups: Vec<Vec<String>>,
    },

    /// A task failed, aborting its whole batch; tasks of the batch that had
    /// not started are abandoned without executing.
    #[error("task {item} failed: {source}")]
    Task {
        /// The item whose task failed.
        item: String,
        /// The failure the task reported.
        source: BuildError,
    },

    /// A scheduler invariant broke (a lost completion channel or result).
    #[error("scheduler internal error: {0}")]
    Internal(String),
}

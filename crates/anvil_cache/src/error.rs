//! Error types for cache operations.

use std::path::PathBuf;

use anvil_common::BuildError;

use crate::bind::BindError;

/// Errors surfaced by the call cache.
///
/// [`CacheError::Build`] wraps an expected failure produced by (or replayed
/// for) the underlying function; it is the only variant that is ever stored
/// in the tables. Every other variant is a programming or environment error:
/// it propagates immediately and never touches the persisted state.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cached function reported (or previously reported) a build failure.
    #[error(transparent)]
    Build(#[from] BuildError),

    /// An I/O error occurred while reading or statting a tracked file.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The call's arguments could not be bound to the function's parameters.
    #[error("cannot bind arguments for `{function}`: {source}")]
    Bind {
        /// The function whose call site was malformed.
        function: String,
        /// The specific binding failure.
        source: BindError,
    },

    /// The snapshot could not be written to disk.
    #[error("failed to write snapshot to {path}: {reason}")]
    Snapshot {
        /// The snapshot path.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },
}

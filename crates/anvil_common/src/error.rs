//! The cacheable build failure taxonomy.

use serde::{Deserialize, Serialize};

/// An expected, cacheable build failure.
///
/// Build errors are stored in the call table exactly like successful results
/// and replayed identically on later calls until the function's digest or one
/// of its input files changes. Programming errors (I/O failures, binding
/// mistakes, panics) are *not* build errors: they propagate immediately and
/// are never cached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BuildError {
    /// A required external tool was not found on the system.
    #[error("tool not found: {tool}")]
    ToolNotFound {
        /// The executable that could not be located.
        tool: String,
    },

    /// An external command ran but exited with a nonzero status.
    #[error("command `{command}` failed with status {status}: {stderr}")]
    CommandFailed {
        /// The program that was invoked.
        command: String,
        /// The exit status code (-1 if terminated by a signal).
        status: i32,
        /// Captured standard error output.
        stderr: String,
    },

    /// An external command exceeded its allotted time and was killed.
    ///
    /// Distinct from [`BuildError::CommandFailed`] so callers can tell a hang
    /// from a genuine failure. Timeouts are cached and replayed like any
    /// other build error until the call's inputs change.
    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout {
        /// The program that was invoked.
        command: String,
        /// The timeout that expired, in whole seconds.
        timeout_secs: u64,
    },

    /// Any other expected failure reported by a build function.
    #[error("{0}")]
    Other(String),
}

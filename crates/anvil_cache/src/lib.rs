//! Persistent call-level memoization for build-step functions.
//!
//! This crate decides, per function invocation, whether cached work can be
//! reused or must be redone. A function opts in by declaring a [`FuncSpec`]
//! (stable name, identity digest, and a file role per parameter); the
//! [`Cache`] then tracks every distinct call's bound arguments, the content
//! digests of the files it read, and its result — including expected build
//! failures, which are replayed identically until something changes.
//!
//! Invalidation cascades from two directions: a changed function digest
//! discards every call record for that function, and a changed file discards
//! only the calls that actually read it. The whole cache persists as a single
//! atomically-written binary snapshot across process runs.

#![warn(missing_docs)]

pub mod bind;
pub mod cache;
pub mod error;
pub mod snapshot;
pub mod tables;

pub use bind::{bind, BindError, BoundArgs, FuncSpec, ParamSpec, Role, ARGS_PARAM, KWARGS_PARAM};
pub use cache::{BuildFn, Cache, CacheConfig, Cached, CallContext};
pub use error::CacheError;
pub use tables::{CallId, CallOutcome, CallRecord, FileRecord, FileStamp, FunctionRecord, Tables};

//! Shared foundational types for the Anvil incremental build engine.
//!
//! This crate provides content digests, the closed [`Value`] type used for
//! bound arguments and cached results, the cacheable [`BuildError`] taxonomy,
//! and a subprocess runner with timeout support.

#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod process;
pub mod value;

pub use digest::Digest;
pub use error::BuildError;
pub use process::{run_with_timeout, CommandOutput};
pub use value::Value;

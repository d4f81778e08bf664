//! The closed value type stored in call records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A concrete, comparable value passed to or returned from a cacheable
/// function.
///
/// The cache only ever stores values of this closed set of shapes, so every
/// argument snapshot and every cached result can be persisted and compared
/// structurally. Records use a `BTreeMap` so that equal records always
/// compare and serialize identically regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// No value (a function run for its side effects, or an absent optional
    /// file parameter).
    Unit,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A string.
    Str(String),
    /// A single filesystem path.
    Path(PathBuf),
    /// A list of filesystem paths.
    Paths(Vec<PathBuf>),
    /// A heterogeneous list.
    List(Vec<Value>),
    /// A string-keyed structured record.
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Returns the paths carried by this value: one for [`Value::Path`], all
    /// for [`Value::Paths`], and none for every other variant.
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            Value::Path(p) => vec![p.clone()],
            Value::Paths(ps) => ps.clone(),
            _ => Vec::new(),
        }
    }

    /// Returns the integer if this is an [`Value::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string if this is a [`Value::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<PathBuf> for Value {
    fn from(v: PathBuf) -> Self {
        Value::Path(v)
    }
}

impl From<Vec<PathBuf>> for Value {
    fn from(v: Vec<PathBuf>) -> Self {
        Value::Paths(v)
    }
}

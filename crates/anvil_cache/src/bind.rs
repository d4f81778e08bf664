//! Function signatures and call-argument binding.
//!
//! A cacheable function declares its parameters up front: a name, a file
//! [`Role`], and an optional default per parameter, plus whether it accepts
//! surplus positional or keyword arguments. [`bind`] resolves a call site's
//! actual arguments against that declaration into a canonical
//! name-to-value map, so two calls that spell the same effective arguments
//! differently (positional vs. keyword vs. defaulted) produce equal
//! [`BoundArgs`] and hit the same call record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use anvil_common::{Digest, Value};

/// Name under which surplus positional arguments are collected.
pub const ARGS_PARAM: &str = "*args";

/// Name under which surplus keyword arguments are collected.
pub const KWARGS_PARAM: &str = "**kwargs";

/// Canonical parameter-name-to-value snapshot of one call.
///
/// This is the lookup key for call records: structural equality of bound
/// arguments, not call-site spelling, decides whether two calls match.
pub type BoundArgs = BTreeMap<String, Value>;

/// How the cache treats one parameter (or the return value) of a cacheable
/// function.
///
/// This classification is the only input the cache needs beyond the raw
/// argument values to know which files a call depends on and produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// An ordinary value with no file tracking.
    Plain,
    /// A path to an input file whose content the call depends on.
    Source,
    /// A list of input file paths.
    SourceList,
    /// A path to a file the call produces.
    Dest,
    /// A list of produced file paths.
    DestList,
    /// A [`Role::Source`] that may be absent ([`Value::Unit`]).
    OptionalSource,
    /// A [`Role::Dest`] that may be absent ([`Value::Unit`]).
    OptionalDest,
}

impl Role {
    /// Returns `true` for roles naming input files.
    pub fn is_source(self) -> bool {
        matches!(self, Role::Source | Role::SourceList | Role::OptionalSource)
    }

    /// Returns `true` for roles naming produced files.
    pub fn is_dest(self) -> bool {
        matches!(self, Role::Dest | Role::DestList | Role::OptionalDest)
    }
}

/// One declared parameter of a cacheable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// The parameter name; the key in [`BoundArgs`].
    pub name: String,

    /// File classification of this parameter.
    pub role: Role,

    /// Value bound when the call site omits this parameter.
    pub default: Option<Value>,
}

impl ParamSpec {
    /// A required parameter with the given role.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            default: None,
        }
    }

    /// An optional parameter bound to `default` when omitted.
    pub fn with_default(name: impl Into<String>, role: Role, default: Value) -> Self {
        Self {
            name: name.into(),
            role,
            default: Some(default),
        }
    }
}

/// The declared signature and identity of a cacheable function.
///
/// Functions cannot be introspected for their source in Rust, so the digest
/// is part of the declaration: callers derive it from the function's source
/// representation (or any stable equality contract) and change it whenever
/// the function's behavior changes. A changed digest cascades: every call
/// record and file edge for the function is discarded before the fresh call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncSpec {
    /// Stable identifier; the key in the function table.
    pub name: String,

    /// Identity digest of the function's source representation.
    pub digest: Digest,

    /// Declared parameters, in positional order.
    pub params: Vec<ParamSpec>,

    /// Whether surplus positional arguments are accepted (collected under
    /// [`ARGS_PARAM`]).
    pub varargs: bool,

    /// Whether unknown keyword arguments are accepted (collected under
    /// [`KWARGS_PARAM`]).
    pub varkw: bool,

    /// File classification of the return value; [`Role::Plain`] when the
    /// function does not return paths.
    pub ret: Role,
}

impl FuncSpec {
    /// A signature with no parameters, no variadics, and a plain return.
    pub fn new(name: impl Into<String>, digest: Digest) -> Self {
        Self {
            name: name.into(),
            digest,
            params: Vec::new(),
            varargs: false,
            varkw: false,
            ret: Role::Plain,
        }
    }

    /// Appends a declared parameter.
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Accepts surplus positional arguments.
    pub fn varargs(mut self) -> Self {
        self.varargs = true;
        self
    }

    /// Accepts unknown keyword arguments.
    pub fn varkw(mut self) -> Self {
        self.varkw = true;
        self
    }

    /// Declares the return value's file role.
    pub fn returns(mut self, role: Role) -> Self {
        self.ret = role;
        self
    }
}

/// Errors produced when a call site does not match a function's declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    /// A required parameter received no argument and has no default.
    #[error("missing required parameter `{param}`")]
    MissingParameter {
        /// The unbound parameter.
        param: String,
    },

    /// A parameter was bound both positionally and by keyword.
    #[error("parameter `{param}` bound more than once")]
    DuplicateParameter {
        /// The doubly-bound parameter.
        param: String,
    },

    /// A keyword argument does not name a declared parameter and the
    /// function does not accept variadic keywords.
    #[error("unknown keyword argument `{name}`")]
    UnknownKeyword {
        /// The unrecognized keyword.
        name: String,
    },

    /// More positional arguments than declared parameters, and the function
    /// does not accept variadic positionals.
    #[error("too many positional arguments: expected at most {expected}, got {got}")]
    TooManyPositional {
        /// Number of declared parameters.
        expected: usize,
        /// Number of positional arguments supplied.
        got: usize,
    },
}

/// Resolves a call's actual arguments against `spec`'s declared parameters.
///
/// Positional arguments fill declared parameters in order; surplus
/// positionals go to the `*args` bucket if the function is variadic.
/// Keyword arguments fill by name; unknown names go to the `**kwargs`
/// bucket if accepted. Remaining parameters take their defaults. The
/// variadic buckets are always present (possibly empty) when declared, so
/// the resulting map is identical however the call was spelled.
pub fn bind(
    spec: &FuncSpec,
    args: &[Value],
    kwargs: &BTreeMap<String, Value>,
) -> Result<BoundArgs, BindError> {
    let mut bound = BTreeMap::new();

    for (i, value) in args.iter().enumerate() {
        match spec.params.get(i) {
            Some(param) => {
                bound.insert(param.name.clone(), value.clone());
            }
            None => {
                if !spec.varargs {
                    return Err(BindError::TooManyPositional {
                        expected: spec.params.len(),
                        got: args.len(),
                    });
                }
                bound.insert(
                    ARGS_PARAM.to_string(),
                    Value::List(args[spec.params.len()..].to_vec()),
                );
                break;
            }
        }
    }

    let mut extra_kw = BTreeMap::new();
    for (name, value) in kwargs {
        if spec.params.iter().any(|p| p.name == *name) {
            if bound.contains_key(name) {
                return Err(BindError::DuplicateParameter {
                    param: name.clone(),
                });
            }
            bound.insert(name.clone(), value.clone());
        } else if spec.varkw {
            extra_kw.insert(name.clone(), value.clone());
        } else {
            return Err(BindError::UnknownKeyword { name: name.clone() });
        }
    }

    for param in &spec.params {
        if !bound.contains_key(&param.name) {
            match &param.default {
                Some(default) => {
                    bound.insert(param.name.clone(), default.clone());
                }
                None => {
                    return Err(BindError::MissingParameter {
                        param: param.name.clone(),
                    })
                }
            }
        }
    }

    if spec.varargs && !bound.contains_key(ARGS_PARAM) {
        bound.insert(ARGS_PARAM.to_string(), Value::List(Vec::new()));
    }
    if spec.varkw {
        bound.insert(KWARGS_PARAM.to_string(), Value::Record(extra_kw));
    }

    Ok(bound)
}

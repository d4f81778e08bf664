//! The persistent cache tables.
//!
//! Three tables back the orchestrator: per-function call records keyed by
//! bound arguments, per-file last-known state, and the call-file edge table
//! joining the two. The edge table is what makes invalidation selective: a
//! changed file discards only the calls that actually read it, while a
//! changed function digest discards every record for that function.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use anvil_common::{BuildError, Digest, Value};

use crate::bind::BoundArgs;

/// Identifies one call record within a function's call table.
///
/// Stable for the lifetime of a function version; reset when the function's
/// digest changes and its records are discarded.
pub type CallId = u32;

/// Terminal outcome of one cached call.
///
/// Build errors are first-class outcomes: they are persisted and replayed
/// exactly like successful values until an input changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// The function returned a value.
    Ok(Value),
    /// The function reported an expected build failure.
    Failed(BuildError),
}

/// One memoized invocation of a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    /// Stable ordinal within the owning function's table.
    pub call_id: CallId,

    /// Canonical argument snapshot; the lookup key.
    pub bound_args: BoundArgs,

    /// Outcome of the most recent execution.
    pub outcome: CallOutcome,

    /// Files this call produced (declared dest parameters, externally
    /// registered dests, and returned paths). Reuse requires that they
    /// still exist on disk.
    pub dests: Vec<PathBuf>,
}

/// Per-function state: identity digest plus all memoized calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Digest of the function's source representation when last seen.
    pub digest: Digest,

    /// All memoized calls, in creation order.
    pub calls: Vec<CallRecord>,

    /// Next ordinal to hand out; never reused within a function version.
    pub next_call_id: CallId,
}

impl FunctionRecord {
    /// An empty record for a function first seen with `digest`.
    pub fn new(digest: Digest) -> Self {
        Self {
            digest,
            calls: Vec::new(),
            next_call_id: 0,
        }
    }
}

/// Last observed state of one tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Modification time as nanoseconds since the Unix epoch.
    pub mtime_ns: u128,

    /// Content digest observed at that mtime.
    pub digest: Digest,
}

/// State of one input file as observed when a call executed.
///
/// Absence is recorded explicitly: a call that failed because a source was
/// missing stays hooked to that path, so creating the file later dirties the
/// call instead of replaying the stale error forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStamp {
    /// The file existed with this content digest.
    Present(Digest),
    /// The file did not exist at execution time.
    Absent,
}

/// The file set one call read, with the state observed for each file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEdges {
    /// The call these edges belong to.
    pub call_id: CallId,

    /// Every file the call read (declared source parameters plus externally
    /// registered sources), with its stamp at execution time.
    pub files: BTreeMap<PathBuf, FileStamp>,
}

/// Counts of live records, for the admin dump surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Number of known functions.
    pub functions: usize,
    /// Total memoized calls across all functions.
    pub calls: usize,
    /// Number of tracked files.
    pub files: usize,
    /// Total call-file edges.
    pub edges: usize,
}

/// All cache tables, as persisted in one snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Per-function call tables, keyed by stable function name.
    pub functions: HashMap<String, FunctionRecord>,

    /// Last known (mtime, digest) per tracked file.
    pub files: HashMap<PathBuf, FileRecord>,

    /// Per-function call-file edge sets.
    pub edges: HashMap<String, Vec<CallEdges>>,

    /// Reverse index: file → calls that read it. Rebuilt from `edges` after
    /// load so `clear_file` touches only the affected records.
    #[serde(skip)]
    file_uses: HashMap<PathBuf, HashSet<(String, CallId)>>,
}

impl Tables {
    /// Finds the memoized call of `name` with exactly these bound arguments.
    pub fn find_call(&self, name: &str, bound: &BoundArgs) -> Option<&CallRecord> {
        self.functions
            .get(name)?
            .calls
            .iter()
            .find(|c| c.bound_args == *bound)
    }

    /// Returns the file edges recorded for one call.
    pub fn edges_for(&self, name: &str, call_id: CallId) -> Option<&BTreeMap<PathBuf, FileStamp>> {
        self.edges
            .get(name)?
            .iter()
            .find(|e| e.call_id == call_id)
            .map(|e| &e.files)
    }

    /// Inserts or updates the memoized call of `name` with these bound
    /// arguments, replacing its file edges. Returns the call's id.
    ///
    /// The function record is created with `digest` if this is the first
    /// call ever recorded for `name`.
    pub fn record_call(
        &mut self,
        name: &str,
        digest: Digest,
        bound: BoundArgs,
        outcome: CallOutcome,
        dests: Vec<PathBuf>,
        files: BTreeMap<PathBuf, FileStamp>,
    ) -> CallId {
        let record = self
            .functions
            .entry(name.to_string())
            .or_insert_with(|| FunctionRecord::new(digest));

        let call_id = match record.calls.iter_mut().find(|c| c.bound_args == bound) {
            Some(call) => {
                call.outcome = outcome;
                call.dests = dests;
                call.call_id
            }
            None => {
                let call_id = record.next_call_id;
                record.next_call_id += 1;
                record.calls.push(CallRecord {
                    call_id,
                    bound_args: bound,
                    outcome,
                    dests,
                });
                call_id
            }
        };

        self.set_edges(name, call_id, files);
        call_id
    }

    /// Discards every call record and file edge of `name`, keeping the
    /// function record itself (cascading invalidation on digest change).
    pub fn invalidate_function(&mut self, name: &str) {
        self.drop_edges(name);
        if let Some(record) = self.functions.get_mut(name) {
            record.calls.clear();
            record.next_call_id = 0;
        }
    }

    /// Removes a function and everything recorded for it. Returns whether
    /// anything was actually removed.
    pub fn remove_function(&mut self, name: &str) -> bool {
        self.drop_edges(name);
        self.functions.remove(name).is_some()
    }

    /// Forgets a file and every call that read it. Returns whether anything
    /// was actually removed.
    ///
    /// Runs in time proportional to the records touching `path`, via the
    /// reverse index.
    pub fn clear_file(&mut self, path: &Path) -> bool {
        let had_record = self.files.remove(path).is_some();
        let uses = self.file_uses.remove(path).unwrap_or_default();
        let removed_calls = !uses.is_empty();

        for (name, call_id) in uses {
            if let Some(record) = self.functions.get_mut(&name) {
                record.calls.retain(|c| c.call_id != call_id);
            }

            // Unhook the call from the reverse-index entries of every other
            // file it read.
            let removed = self.edges.get_mut(&name).and_then(|sets| {
                sets.iter()
                    .position(|e| e.call_id == call_id)
                    .map(|pos| sets.swap_remove(pos))
            });
            if let Some(edges) = removed {
                for other in edges.files.keys() {
                    if let Some(set) = self.file_uses.get_mut(other) {
                        set.remove(&(name.clone(), call_id));
                    }
                }
            }
        }

        had_record || removed_calls
    }

    /// Rebuilds the reverse file index from the edge table. Must be called
    /// after deserializing a snapshot.
    pub fn rebuild_index(&mut self) {
        self.file_uses.clear();
        for (name, sets) in &self.edges {
            for edge_set in sets {
                for path in edge_set.files.keys() {
                    self.file_uses
                        .entry(path.clone())
                        .or_default()
                        .insert((name.clone(), edge_set.call_id));
                }
            }
        }
    }

    /// Counts of live records.
    pub fn stats(&self) -> TableStats {
        TableStats {
            functions: self.functions.len(),
            calls: self.functions.values().map(|f| f.calls.len()).sum(),
            files: self.files.len(),
            edges: self
                .edges
                .values()
                .flat_map(|sets| sets.iter())
                .map(|e| e.files.len())
                .sum(),
        }
    }

    /// Replaces the edge set of one call and keeps the reverse index in sync.
    fn set_edges(&mut self, name: &str, call_id: CallId, files: BTreeMap<PathBuf, FileStamp>) {
        let old = self.edges.get_mut(name).and_then(|sets| {
            sets.iter()
                .position(|e| e.call_id == call_id)
                .map(|pos| sets.swap_remove(pos))
        });
        if let Some(old) = old {
            for path in old.files.keys() {
                if let Some(set) = self.file_uses.get_mut(path) {
                    set.remove(&(name.to_string(), call_id));
                }
            }
        }

        for path in files.keys() {
            self.file_uses
                .entry(path.clone())
                .or_default()
                .insert((name.to_string(), call_id));
        }
        self.edges
            .entry(name.to_string())
            .or_default()
            .push(CallEdges { call_id, files });
    }

    /// Drops every edge set of `name`, unhooking the reverse index.
    fn drop_edges(&mut self, name: &str) {
        if let Some(sets) = self.edges.remove(name) {
            for edge_set in sets {
                for path in edge_set.files.keys() {
                    if let Some(set) = self.file_uses.get_mut(path) {
                        set.remove(&(name.to_string(), edge_set.call_id));
                    }
                }
            }
        }
    }
}

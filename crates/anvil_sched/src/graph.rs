//! The per-batch task graph.
//!
//! Built fresh for every `map_with_dependencies` invocation: dependency
//! targets from the discovery pass are resolved to item indices (targets not
//! present in the batch are silently ignored), cycles are rejected before
//! anything runs, and the deterministic output order is the depth-first
//! postorder over items in their original order.

use std::collections::HashSet;
use std::fmt::Debug;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::SchedError;

/// Dependency edges for one scheduling batch, resolved to item indices.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Direct dependencies per task (deduplicated, in declared order).
    deps: Vec<Vec<usize>>,
    /// Direct dependents per task: tasks that list it as a dependency.
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Builds adjacency for `deps.len()` tasks from per-task dependency
    /// index lists.
    pub fn new(deps: Vec<Vec<usize>>) -> Self {
        let mut dependents = vec![Vec::new(); deps.len()];
        for (task, task_deps) in deps.iter().enumerate() {
            for &dep in task_deps {
                dependents[dep].push(task);
            }
        }
        Self { deps, dependents }
    }

    /// Resolves discovered dependency targets to indices within `items`.
    ///
    /// Matching is by equality against the batch's own items; a target with
    /// no match is silently ignored, duplicates are dropped.
    pub fn resolve<T: PartialEq + Debug>(items: &[T], discovered: &[Vec<T>]) -> Vec<Vec<usize>> {
        discovered
            .iter()
            .map(|targets| {
                let mut seen = HashSet::new();
                let mut deps = Vec::new();
                for target in targets {
                    match items.iter().position(|item| item == target) {
                        Some(idx) => {
                            if seen.insert(idx) {
                                deps.push(idx);
                            }
                        }
                        None => {
                            debug!(dep = ?target, "dependency target not in batch; ignoring");
                        }
                    }
                }
                deps
            })
            .collect()
    }

    /// Direct dependencies of one task.
    pub fn deps(&self, task: usize) -> &[usize] {
        &self.deps[task]
    }

    /// Direct dependents of one task.
    pub fn dependents(&self, task: usize) -> &[usize] {
        &self.dependents[task]
    }

    /// Rejects the batch if the graph has cycles, reporting every minimal
    /// cyclic group at once.
    pub fn check_acyclic<T: Debug>(&self, items: &[T]) -> Result<(), SchedError> {
        let mut graph = DiGraph::<(), ()>::new();
        for _ in 0..self.deps.len() {
            graph.add_node(());
        }
        for (task, task_deps) in self.deps.iter().enumerate() {
            for &dep in task_deps {
                graph.add_edge(NodeIndex::new(dep), NodeIndex::new(task), ());
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || graph.find_edge(component[0], component[0]).is_some();
            if is_cycle {
                let mut group: Vec<usize> = component.iter().map(|n| n.index()).collect();
                group.sort_unstable();
                groups.push(group);
            }
        }

        if groups.is_empty() {
            return Ok(());
        }

        groups.sort_by_key(|g| g[0]);
        Err(SchedError::Cycle {
            groups: groups
                .into_iter()
                .map(|group| {
                    group
                        .into_iter()
                        .map(|idx| format!("{:?}", items[idx]))
                        .collect()
                })
                .collect(),
        })
    }

    /// Deterministic output order: items in original order, each preceded
    /// by its (not yet visited) dependencies, depth first.
    ///
    /// Stable across runs regardless of actual completion order.
    pub fn postorder(&self) -> Vec<usize> {
        fn visit(task: usize, deps: &[Vec<usize>], visited: &mut [bool], out: &mut Vec<usize>) {
            if visited[task] {
                return;
            }
            visited[task] = true;
            for &dep in &deps[task] {
                visit(dep, deps, visited, out);
            }
            out.push(task);
        }

        let mut visited = vec![false; self.deps.len()];
        let mut out = Vec::with_capacity(self.deps.len());
        for task in 0..self.deps.len() {
            visit(task, &self.deps, &mut visited, &mut out);
        }
        out
    }
}

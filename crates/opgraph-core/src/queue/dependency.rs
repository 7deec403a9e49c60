//! Dependency graph for cycle detection among admitted tasks.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::TaskId;

/// Dependency graph for tracking task dependencies.
///
/// - `edges`: TaskId -> Set of TaskIds it depends on
/// - `reverse_edges`: TaskId -> Set of TaskIds waiting for it
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<TaskId, HashSet<TaskId>>,
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` depends on `depends_on` ("task waits for depends_on").
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drop every edge touching `task`.
    pub fn remove_task(&mut self, task: TaskId) {
        for depends_on in self.get_dependencies(task) {
            self.remove_dependency(task, depends_on);
        }
        for waiting in self.get_waiting_tasks(task) {
            self.remove_dependency(waiting, task);
        }
    }

    /// Tasks waiting for `task`.
    pub fn get_waiting_tasks(&self, task: TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(&task)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges
            .get(&task)
            .map(|deps| !deps.is_empty())
            .unwrap_or(false)
    }

    pub fn get_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        self.edges
            .get(&task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    /// First cycle found anywhere in the graph, as a path that starts and
    /// ends on the same task.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors = HashMap::new();
        let mut roots: Vec<TaskId> = self.edges.keys().copied().collect();
        roots.sort();
        for root in roots {
            if colors.contains_key(&root) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs_cycle(root, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// Cycle reachable from `start`, if any.
    pub fn detect_cycle_from(&self, start: TaskId) -> Option<Vec<TaskId>> {
        let mut colors = HashMap::new();
        let mut path = Vec::new();
        self.dfs_cycle(start, &mut colors, &mut path)
    }

    // 白(未訪問) / 灰(探索中) / 黒(探索済み) の三色 DFS
    fn dfs_cycle(
        &self,
        node: TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        if let Some(deps) = self.edges.get(&node) {
            for &dep in deps {
                match colors.get(&dep) {
                    Some(Color::Gray) => {
                        let start = path.iter().position(|&id| id == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<const N: usize>() -> [TaskId; N] {
        std::array::from_fn(|_| TaskId::generate())
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();

        graph.add_dependency(b, a); // B waits for A

        assert!(graph.has_dependencies(b));
        assert!(!graph.has_dependencies(a));
        assert_eq!(graph.get_dependencies(b), vec![a]);
        assert_eq!(graph.get_waiting_tasks(a), vec![b]);
    }

    #[test]
    fn remove_task_drops_edges_in_both_directions() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids();
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        graph.remove_task(b);

        assert_eq!(graph.edge_count(), 0);
        assert!(graph.get_waiting_tasks(a).is_empty());
        assert!(!graph.has_dependencies(c));
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids();
        graph.add_dependency(a, b);
        graph.add_dependency(b, a);

        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        let [a] = ids();
        graph.add_dependency(a, a);
        assert_eq!(graph.detect_cycle_from(a), Some(vec![a, a]));
    }

    #[test]
    fn detect_longer_cycle_from_outside() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();
        // A -> B -> C -> D -> B
        graph.add_dependency(a, b);
        graph.add_dependency(b, c);
        graph.add_dependency(c, d);
        graph.add_dependency(d, b);

        let cycle = graph.detect_cycle_from(a).unwrap();
        assert_eq!(cycle.first(), Some(&b));
        assert_eq!(cycle.last(), Some(&b));
        assert!(!cycle.contains(&a));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids();
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(d, c);
        graph.add_dependency(d, a);

        assert!(graph.detect_cycle().is_none());
        assert!(graph.detect_cycle_from(d).is_none());
    }
}

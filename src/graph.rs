//! Pure in-memory dependency graph (C3).
//!
//! Adjacency stored in both directions -- a `deps` map (dependent ->
//! dependencies) and a `dependents` map (dependency -> dependents) --
//! mirroring the `parents_by_child`/`children_by_parent` dual-map shape
//! of `dependency_graph.rs` in the pack, generalized from a single tree
//! edge to an arbitrary DAG edge set. No I/O, no task storage: the
//! [`crate::service::TaskService`] builds one of these from whatever the
//! store currently holds before running a query or a mutation check
//! against it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::types::{Dependency, Priority, TaskId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// An in-memory view of every "depends on" edge among a set of tasks.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// `dependent -> { dependency, ... }`: what each task is waiting on.
    deps: HashMap<TaskId, HashSet<TaskId>>,
    /// `dependency -> { dependent, ... }`: what each task unblocks.
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a graph from a flat edge list, registering every endpoint
    /// (even ones with no edges) as a node with empty adjacency so
    /// queries against an isolated task return `[]` rather than
    /// requiring a presence check first.
    pub fn from_edges(node_ids: impl IntoIterator<Item = TaskId>, edges: &[Dependency]) -> Self {
        let mut graph = Self::empty();
        for id in node_ids {
            graph.deps.entry(id.clone()).or_default();
            graph.dependents.entry(id).or_default();
        }
        for edge in edges {
            graph.insert_edge(edge.dependent_id.clone(), edge.dependency_id.clone());
        }
        graph
    }

    fn insert_edge(&mut self, dependent_id: TaskId, dependency_id: TaskId) {
        self.deps
            .entry(dependent_id.clone())
            .or_default()
            .insert(dependency_id.clone());
        self.dependents
            .entry(dependency_id)
            .or_default()
            .insert(dependent_id);
    }

    /// Ids `id` directly depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.deps
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids directly blocked on `id`.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// `true` if `id` has at least one recorded dependency -- does not
    /// consult task status; callers combine this with the status of each
    /// entry from [`DependencyGraph::blocked_by`] to ask "blocked on
    /// *incomplete* work".
    pub fn is_blocked(&self, id: &TaskId) -> bool {
        self.deps.get(id).is_some_and(|set| !set.is_empty())
    }

    /// Alias for [`DependencyGraph::dependencies_of`], named for the
    /// "what is this task blocked by" query (§4.3).
    pub fn blocked_by(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependencies_of(id)
    }

    /// Finds every cycle in the graph using a three-color (white/gray/
    /// black) DFS, so pathological cyclic input still terminates in
    /// `O(V+E)` instead of looping. Returns each cycle as the sequence of
    /// ids walked from its first repeated node back to itself.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut color: HashMap<TaskId, Color> =
            self.deps.keys().map(|id| (id.clone(), Color::White)).collect();
        let mut stack: Vec<TaskId> = Vec::new();
        let mut cycles = Vec::new();

        let mut ids: Vec<TaskId> = self.deps.keys().cloned().collect();
        ids.sort();

        for start in ids {
            if color.get(&start) != Some(&Color::White) {
                continue;
            }
            self.visit_for_cycles(&start, &mut color, &mut stack, &mut cycles);
        }
        cycles
    }

    fn visit_for_cycles(
        &self,
        node: &TaskId,
        color: &mut HashMap<TaskId, Color>,
        stack: &mut Vec<TaskId>,
        cycles: &mut Vec<Vec<TaskId>>,
    ) {
        color.insert(node.clone(), Color::Gray);
        stack.push(node.clone());

        let mut neighbors = self.dependencies_of(node);
        neighbors.sort();
        for next in neighbors {
            match color.get(&next) {
                Some(Color::White) | None => {
                    self.visit_for_cycles(&next, color, stack, cycles);
                }
                Some(Color::Gray) => {
                    let start = stack.iter().position(|n| n == &next).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = stack[start..].to_vec();
                    cycle.push(next.clone());
                    cycles.push(cycle);
                }
                Some(Color::Black) => {}
            }
        }

        stack.pop();
        color.insert(node.clone(), Color::Black);
    }

    /// Would adding `dependent -> dependency` close a cycle in the
    /// current graph? Checked by asking whether `dependent` is already
    /// reachable from `dependency` -- if so, the new edge would complete
    /// a loop back to itself.
    pub fn would_create_cycle(&self, dependent_id: &TaskId, dependency_id: &TaskId) -> bool {
        if dependent_id == dependency_id {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(dependency_id.clone());
        seen.insert(dependency_id.clone());
        while let Some(node) = queue.pop_front() {
            if &node == dependent_id {
                return true;
            }
            for next in self.dependencies_of(&node) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// A deterministic topological order via Kahn's algorithm, breaking
    /// ties with a max-heap keyed by `(priority descending, id ascending)`
    /// so two graphs with the same edges and the same task priorities
    /// always order identically. Returns `None` if the graph is cyclic.
    pub fn topological_order(&self, priorities: &HashMap<TaskId, f64>) -> Option<Vec<TaskId>> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .deps
            .keys()
            .map(|id| (id.clone(), self.deps.get(id).map(|s| s.len()).unwrap_or(0)))
            .collect();

        #[derive(Eq, PartialEq)]
        struct Ready(i64, TaskId);
        impl Ord for Ready {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0
                    .cmp(&other.0)
                    .then_with(|| self.1.cmp(&other.1))
            }
        }
        impl PartialOrd for Ready {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let priority_key = |id: &TaskId| -> i64 {
            let score = priorities.get(id).copied().unwrap_or(0.0);
            (score * 1000.0) as i64
        };

        let mut heap = BinaryHeap::new();
        for (id, degree) in &in_degree {
            if *degree == 0 {
                heap.push(Reverse(Ready(-priority_key(id), id.clone())));
            }
        }

        let mut order = Vec::with_capacity(self.deps.len());
        while let Some(Reverse(Ready(_, id))) = heap.pop() {
            order.push(id.clone());
            for dependent in self.dependents_of(&id) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        heap.push(Reverse(Ready(-priority_key(&dependent), dependent)));
                    }
                }
            }
        }

        if order.len() == self.deps.len() {
            Some(order)
        } else {
            None
        }
    }

    /// Tasks with no incomplete dependency, i.e. every entry of
    /// [`DependencyGraph::dependencies_of`] is in `done_ids`. Does not
    /// itself filter by status -- callers pass the id set they consider
    /// "done" (§4.7: "available" means not blocked and not itself done).
    pub fn executable_tasks(&self, done_ids: &HashSet<TaskId>) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = self
            .deps
            .iter()
            .filter(|(_, dependencies)| dependencies.iter().all(|d| done_ids.contains(d)))
            .map(|(id, _)| id.clone())
            .collect();
        out.sort();
        out
    }

    /// Shortest directed path `from -> to` following dependency edges
    /// (`from` depends transitively on `to`), via BFS. `None` if no path
    /// exists.
    pub fn shortest_path(&self, from: &TaskId, to: &TaskId) -> Option<Vec<TaskId>> {
        if from == to {
            return Some(vec![from.clone()]);
        }
        let mut visited = HashSet::new();
        let mut parent: HashMap<TaskId, TaskId> = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(from.clone());
        visited.insert(from.clone());

        while let Some(node) = queue.pop_front() {
            for next in self.dependencies_of(&node) {
                if visited.insert(next.clone()) {
                    parent.insert(next.clone(), node.clone());
                    if &next == to {
                        let mut path = vec![next.clone()];
                        let mut cursor = next;
                        while let Some(p) = parent.get(&cursor) {
                            path.push(p.clone());
                            cursor = p.clone();
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// The longest dependency chain ending at `id` (its depth in the
    /// DAG), `0` for a task with no dependencies. `None` if the
    /// dependency subgraph rooted at `id` is cyclic.
    pub fn depth(&self, id: &TaskId) -> Option<usize> {
        let mut memo = HashMap::new();
        self.depth_rec(id, &mut memo, &mut HashSet::new())
    }

    fn depth_rec(
        &self,
        id: &TaskId,
        memo: &mut HashMap<TaskId, usize>,
        in_progress: &mut HashSet<TaskId>,
    ) -> Option<usize> {
        if let Some(d) = memo.get(id) {
            return Some(*d);
        }
        if !in_progress.insert(id.clone()) {
            return None;
        }
        let mut max_child = 0usize;
        for dep in self.dependencies_of(id) {
            let child_depth = self.depth_rec(&dep, memo, in_progress)?;
            max_child = max_child.max(child_depth + 1);
        }
        in_progress.remove(id);
        memo.insert(id.clone(), max_child);
        Some(max_child)
    }

    /// Buckets every known id's priority for display purposes, useful
    /// alongside [`DependencyGraph::topological_order`] when a caller
    /// wants the human-readable bucket rather than the raw score.
    pub fn priority_bucket(score: f64) -> Priority {
        Priority::from_score(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::from(s)
    }

    fn edge(a: &str, b: &str) -> Dependency {
        Dependency::new(id(a), id(b)).unwrap()
    }

    #[test]
    fn dependencies_and_dependents_are_mirror_images() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b")],
            &[edge("a", "b")],
        );
        assert_eq!(graph.dependencies_of(&id("a")), vec![id("b")]);
        assert_eq!(graph.dependents_of(&id("b")), vec![id("a")]);
    }

    #[test]
    fn is_blocked_reflects_presence_of_any_dependency() {
        let graph = DependencyGraph::from_edges([id("a"), id("b")], &[edge("a", "b")]);
        assert!(graph.is_blocked(&id("a")));
        assert!(!graph.is_blocked(&id("b")));
    }

    #[test]
    fn would_create_cycle_detects_direct_and_transitive_loops() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b"), id("c")],
            &[edge("a", "b"), edge("b", "c")],
        );
        assert!(graph.would_create_cycle(&id("c"), &id("a")));
        assert!(graph.would_create_cycle(&id("a"), &id("a")));
        // a already reaches c transitively (a -> b -> c); adding a
        // redundant direct edge a -> c closes no new loop.
        assert!(!graph.would_create_cycle(&id("a"), &id("c")));
    }

    #[test]
    fn find_cycles_terminates_on_cyclic_input() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b"), id("c")],
            &[edge("a", "b"), edge("b", "c"), edge("c", "a")],
        );
        let cycles = graph.find_cycles();
        assert!(!cycles.is_empty());
    }

    #[test]
    fn topological_order_respects_edges_and_priority_tiebreak() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b"), id("c")],
            &[edge("a", "c"), edge("b", "c")],
        );
        let mut priorities = HashMap::new();
        priorities.insert(id("a"), 90.0);
        priorities.insert(id("b"), 10.0);
        priorities.insert(id("c"), 50.0);
        let order = graph.topological_order(&priorities).unwrap();
        assert_eq!(order[0], id("c"));
        assert_eq!(order[1], id("a"));
        assert_eq!(order[2], id("b"));
    }

    #[test]
    fn topological_order_is_none_for_cyclic_graph() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b")],
            &[edge("a", "b"), edge("b", "a")],
        );
        assert!(graph.topological_order(&HashMap::new()).is_none());
    }

    #[test]
    fn executable_tasks_excludes_blocked_work() {
        let graph = DependencyGraph::from_edges([id("a"), id("b")], &[edge("a", "b")]);
        let mut done = HashSet::new();
        assert_eq!(graph.executable_tasks(&done), vec![id("b")]);
        done.insert(id("b"));
        assert_eq!(graph.executable_tasks(&done), vec![id("a"), id("b")]);
    }

    #[test]
    fn shortest_path_finds_transitive_chain() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b"), id("c")],
            &[edge("a", "b"), edge("b", "c")],
        );
        assert_eq!(
            graph.shortest_path(&id("a"), &id("c")),
            Some(vec![id("a"), id("b"), id("c")])
        );
        assert_eq!(graph.shortest_path(&id("c"), &id("a")), None);
    }

    #[test]
    fn depth_counts_longest_dependency_chain() {
        let graph = DependencyGraph::from_edges(
            [id("a"), id("b"), id("c")],
            &[edge("a", "b"), edge("b", "c")],
        );
        assert_eq!(graph.depth(&id("c")), Some(0));
        assert_eq!(graph.depth(&id("b")), Some(1));
        assert_eq!(graph.depth(&id("a")), Some(2));
    }
}

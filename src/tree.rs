//! In-memory task hierarchy tree (C4).
//!
//! Arena-backed per the design notes: tasks live in a flat `Vec<Node>`
//! indexed by [`NodeIndex`], with a `HashMap<TaskId, NodeIndex>` lookup
//! table, so parent/child links are index edges rather than owning
//! `Rc`/`RefCell` pointers -- the same index-based-relation shape
//! [`crate::graph::DependencyGraph`] uses for its adjacency maps,
//! generalized here from a DAG to a rooted forest.
//!
//! Pure and read-only: built fresh from whatever the store currently
//! holds, never mutated in place by callers. Mutation goes through the
//! store; this module only answers navigation and query questions over
//! a snapshot.

use std::collections::{HashMap, VecDeque};

use crate::error::EngineError;
use crate::types::{Task, TaskId, TaskStatus, TaskUpdate};

/// Signal a traversal visitor returns to control the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalControl {
    /// Keep walking normally.
    Continue,
    /// Skip this node's children but keep walking siblings/the rest of
    /// the tree (pre-order only; ignored by breadth-first).
    SkipChildren,
    /// Stop the walk immediately.
    Stop,
}

/// A single operation in the batch form accepted by
/// [`TaskTree::apply_ops`] (§4.4 "batch form").
#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Equivalent to [`TaskTree::with_task`].
    UpdateTask {
        /// The task to update.
        id: TaskId,
        /// The fields to change.
        updates: TaskUpdate,
    },
    /// Sets `status` on `root` and every descendant, matching
    /// [`crate::service::TaskService::update_tree_status`]'s semantics
    /// but as a pure tree transformation with no store I/O.
    BulkStatusUpdate {
        /// The subtree root.
        root: TaskId,
        /// The status to set on the root and all of its descendants.
        status: TaskStatus,
    },
}

/// An index into a [`TaskTree`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

#[derive(Debug, Clone)]
struct Node {
    task: Task,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
}

/// An error building a [`TaskTree`] from a flat task list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeBuildError {
    /// A task names a `parent_id` not present in the input set.
    #[error("task {child} names unknown parent {parent}")]
    UnknownParent {
        /// The task with the dangling reference.
        child: TaskId,
        /// The parent id that could not be found.
        parent: TaskId,
    },
    /// Two tasks in the input shared the same id.
    #[error("duplicate task id {id}")]
    DuplicateId {
        /// The id that appeared more than once.
        id: TaskId,
    },
}

/// A rooted forest of tasks, built once from a flat list and queried
/// read-only thereafter.
#[derive(Debug, Clone, Default)]
pub struct TaskTree {
    nodes: Vec<Node>,
    index_of: HashMap<TaskId, NodeIndex>,
    roots: Vec<NodeIndex>,
}

impl TaskTree {
    /// Builds a tree from a flat task list. Validates that every
    /// `parent_id` resolves within the same input set and that no id
    /// repeats.
    ///
    /// # Errors
    ///
    /// [`TreeBuildError::DuplicateId`] or [`TreeBuildError::UnknownParent`].
    pub fn build(tasks: Vec<Task>) -> Result<Self, TreeBuildError> {
        let mut tree = Self::default();
        for task in &tasks {
            if tree.index_of.contains_key(&task.id) {
                return Err(TreeBuildError::DuplicateId {
                    id: task.id.clone(),
                });
            }
            let idx = NodeIndex(tree.nodes.len());
            tree.index_of.insert(task.id.clone(), idx);
            tree.nodes.push(Node {
                task: task.clone(),
                parent: None,
                children: Vec::new(),
            });
        }

        for task in &tasks {
            let idx = tree.index_of[&task.id];
            match &task.parent_id {
                None => tree.roots.push(idx),
                Some(parent_id) => match tree.index_of.get(parent_id).copied() {
                    Some(parent_idx) => {
                        tree.nodes[idx.0].parent = Some(parent_idx);
                        tree.nodes[parent_idx.0].children.push(idx);
                    }
                    None => {
                        return Err(TreeBuildError::UnknownParent {
                            child: task.id.clone(),
                            parent: parent_id.clone(),
                        })
                    }
                },
            }
        }

        Ok(tree)
    }

    /// Number of tasks in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// `true` iff the tree holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every root task (no parent), in input order.
    pub fn roots(&self) -> Vec<&Task> {
        self.roots.iter().map(|idx| &self.nodes[idx.0].task).collect()
    }

    /// Fetches a task by id.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index_of.get(id).map(|idx| &self.nodes[idx.0].task)
    }

    /// Direct children of `id`, in insertion order.
    pub fn children_of(&self, id: &TaskId) -> Vec<&Task> {
        self.index_of
            .get(id)
            .map(|idx| {
                self.nodes[idx.0]
                    .children
                    .iter()
                    .map(|c| &self.nodes[c.0].task)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The parent task of `id`, or `None` for a root or an unknown id.
    pub fn parent_of(&self, id: &TaskId) -> Option<&Task> {
        let idx = self.index_of.get(id)?;
        let parent_idx = self.nodes[idx.0].parent?;
        Some(&self.nodes[parent_idx.0].task)
    }

    /// The path from the root to `id`, inclusive, root-first. `None` if
    /// `id` is unknown.
    pub fn path_to(&self, id: &TaskId) -> Option<Vec<&Task>> {
        let mut idx = *self.index_of.get(id)?;
        let mut path = vec![idx];
        while let Some(parent) = self.nodes[idx.0].parent {
            path.push(parent);
            idx = parent;
        }
        path.reverse();
        Some(path.into_iter().map(|i| &self.nodes[i.0].task).collect())
    }

    /// Every descendant of `id` (not including `id` itself), in
    /// depth-first pre-order.
    pub fn descendants_of(&self, id: &TaskId) -> Vec<&Task> {
        let mut out = Vec::new();
        if let Some(&idx) = self.index_of.get(id) {
            self.collect_descendants(idx, &mut out);
        }
        out
    }

    fn collect_descendants<'a>(&'a self, idx: NodeIndex, out: &mut Vec<&'a Task>) {
        for &child in &self.nodes[idx.0].children {
            out.push(&self.nodes[child.0].task);
            self.collect_descendants(child, out);
        }
    }

    /// Every task in the tree, depth-first pre-order starting from the
    /// roots in insertion order.
    pub fn iter_preorder(&self) -> Vec<&Task> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for &root in &self.roots {
            out.push(&self.nodes[root.0].task);
            self.collect_descendants(root, &mut out);
        }
        out
    }

    /// `id`'s depth in the tree: `0` for a root, `parent depth + 1`
    /// otherwise. `None` if `id` is unknown.
    pub fn depth_of(&self, id: &TaskId) -> Option<usize> {
        let idx = *self.index_of.get(id)?;
        let mut depth = 0;
        let mut cursor = idx;
        while let Some(parent) = self.nodes[cursor.0].parent {
            depth += 1;
            cursor = parent;
        }
        Some(depth)
    }

    /// `true` if `candidate_ancestor` is `id` or a proper ancestor of
    /// `id` -- used to reject a move that would re-parent a subtree into
    /// one of its own descendants.
    pub fn is_ancestor_of(&self, candidate_ancestor: &TaskId, id: &TaskId) -> bool {
        let Some(mut cursor) = self.index_of.get(id).copied() else {
            return false;
        };
        loop {
            if &self.nodes[cursor.0].task.id == candidate_ancestor {
                return true;
            }
            match self.nodes[cursor.0].parent {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    /// The effective status of `id`: if any ancestor's raw status is
    /// `done`, `cancelled`, or `archived`, the effective status is that
    /// ancestor's status, with `done` outranking `cancelled` outranking
    /// `archived` when more than one ancestor qualifies; otherwise the
    /// task's own raw status. A computed view, never stored (§9
    /// "effective status as pure computed view").
    pub fn effective_status(&self, id: &TaskId) -> Option<TaskStatus> {
        let idx = *self.index_of.get(id)?;
        fn rank(status: TaskStatus) -> Option<u8> {
            match status {
                TaskStatus::Done => Some(0),
                TaskStatus::Cancelled => Some(1),
                TaskStatus::Archived => Some(2),
                _ => None,
            }
        }

        let mut best: Option<(u8, TaskStatus)> = None;
        let mut cursor = self.nodes[idx.0].parent;
        while let Some(p) = cursor {
            let status = self.nodes[p.0].task.status;
            if let Some(r) = rank(status) {
                if best.is_none_or(|(best_r, _)| r < best_r) {
                    best = Some((r, status));
                }
            }
            cursor = self.nodes[p.0].parent;
        }
        match best {
            Some((_, status)) => Some(status),
            None => Some(self.nodes[idx.0].task.status),
        }
    }

    /// Siblings of `id`: every other child of `id`'s parent (roots are
    /// siblings of other roots).
    pub fn siblings_of(&self, id: &TaskId) -> Vec<&Task> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        let siblings: &[NodeIndex] = match self.nodes[idx.0].parent {
            Some(parent) => &self.nodes[parent.0].children,
            None => &self.roots,
        };
        siblings
            .iter()
            .filter(|&&s| s != idx)
            .map(|s| &self.nodes[s.0].task)
            .collect()
    }

    /// `true` iff `a` and `b` share the same parent (or both are roots)
    /// and are distinct tasks.
    pub fn is_sibling_of(&self, a: &TaskId, b: &TaskId) -> bool {
        if a == b {
            return false;
        }
        let (Some(&ia), Some(&ib)) = (self.index_of.get(a), self.index_of.get(b)) else {
            return false;
        };
        self.nodes[ia.0].parent == self.nodes[ib.0].parent
    }

    /// `true` if `id` is `candidate_descendant` or a proper descendant of
    /// `candidate_descendant` -- the mirror of [`TaskTree::is_ancestor_of`].
    pub fn is_descendant_of(&self, candidate_descendant: &TaskId, id: &TaskId) -> bool {
        self.is_ancestor_of(id, candidate_descendant)
    }

    /// Number of descendants of `id` (not including `id` itself).
    pub fn descendant_count(&self, id: &TaskId) -> usize {
        self.descendants_of(id).len()
    }

    /// Depth-first pre-order walk starting from the roots, calling
    /// `visit` on every task. `visit` returns a [`TraversalControl`]: a
    /// node reporting `SkipChildren` still lets the walk continue with
    /// its siblings and the rest of the tree; `Stop` ends the walk
    /// immediately.
    pub fn walk_preorder<F>(&self, mut visit: F)
    where
        F: FnMut(&Task) -> TraversalControl,
    {
        for &root in &self.roots {
            if !self.walk_preorder_from(root, &mut visit) {
                return;
            }
        }
    }

    /// Returns `false` if the caller should stop walking entirely.
    fn walk_preorder_from<F>(&self, idx: NodeIndex, visit: &mut F) -> bool
    where
        F: FnMut(&Task) -> TraversalControl,
    {
        match visit(&self.nodes[idx.0].task) {
            TraversalControl::Stop => return false,
            TraversalControl::SkipChildren => return true,
            TraversalControl::Continue => {}
        }
        for &child in &self.nodes[idx.0].children {
            if !self.walk_preorder_from(child, visit) {
                return false;
            }
        }
        true
    }

    /// Breadth-first walk starting from the roots (roots enqueued in
    /// insertion order), calling `visit` on every task. `SkipChildren`
    /// and `Continue` behave identically here (children are enqueued as
    /// siblings are visited, not nested) except that `SkipChildren`
    /// still prevents `idx`'s own children from being enqueued; `Stop`
    /// ends the walk immediately.
    pub fn walk_breadth_first<F>(&self, mut visit: F)
    where
        F: FnMut(&Task) -> TraversalControl,
    {
        let mut queue: VecDeque<NodeIndex> = self.roots.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            match visit(&self.nodes[idx.0].task) {
                TraversalControl::Stop => return,
                TraversalControl::SkipChildren => continue,
                TraversalControl::Continue => {
                    queue.extend(self.nodes[idx.0].children.iter().copied());
                }
            }
        }
    }

    /// The first task (in pre-order) satisfying `predicate`.
    pub fn find<F>(&self, predicate: F) -> Option<&Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut found = None;
        self.walk_preorder(|task| {
            if predicate(task) {
                found = Some(task);
                TraversalControl::Stop
            } else {
                TraversalControl::Continue
            }
        });
        found
    }

    /// Every task (in pre-order) satisfying `predicate`.
    pub fn filter<F>(&self, predicate: F) -> Vec<&Task>
    where
        F: Fn(&Task) -> bool,
    {
        let mut out = Vec::new();
        self.walk_preorder(|task| {
            if predicate(task) {
                out.push(task);
            }
            TraversalControl::Continue
        });
        out
    }

    /// Every task currently in the tree, as an owned `Vec` -- the
    /// starting point for the pure transformation methods below, which
    /// rebuild a whole new tree from a modified copy of this list.
    fn snapshot(&self) -> Vec<Task> {
        self.iter_preorder().into_iter().cloned().collect()
    }

    /// A pure transformation: returns a new tree with `updates` applied
    /// to `id`, leaving `self` untouched.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] if `id` is not in this tree;
    /// [`EngineError::Corrupt`] if `updates` sets an out-of-bounds title,
    /// description, or priority score; any error [`TaskTree::build`]
    /// would raise on the resulting task list (also wrapped as
    /// [`EngineError::Corrupt`]).
    pub fn with_task(&self, id: &TaskId, updates: &TaskUpdate) -> Result<TaskTree, EngineError> {
        let mut tasks = self.snapshot();
        let task = tasks
            .iter_mut()
            .find(|t| &t.id == id)
            .ok_or_else(|| EngineError::NotFound { id: id.clone() })?;
        apply_update(task, updates)?;
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt { what: e.to_string() })
    }

    /// A pure transformation: returns a new tree with `child` attached
    /// beneath `parent_id` (`None` attaches as a new root).
    ///
    /// # Errors
    ///
    /// [`EngineError::GraphInvariant`] if `parent_id` is `Some` and not
    /// present in this tree.
    pub fn add_child(
        &self,
        parent_id: Option<TaskId>,
        mut child: Task,
    ) -> Result<TaskTree, EngineError> {
        if let Some(ref parent) = parent_id {
            if self.get(parent).is_none() {
                return Err(EngineError::GraphInvariant {
                    reason: format!("unknown parent {parent}"),
                });
            }
        }
        child.parent_id = parent_id;
        let mut tasks = self.snapshot();
        tasks.push(child);
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt { what: e.to_string() })
    }

    /// A pure transformation: returns a new tree with `id` and every one
    /// of its descendants removed.
    pub fn remove_child(&self, id: &TaskId) -> Result<TaskTree, EngineError> {
        let doomed: std::collections::HashSet<TaskId> = std::iter::once(id.clone())
            .chain(self.descendants_of(id).into_iter().map(|t| t.id.clone()))
            .collect();
        let tasks: Vec<Task> = self
            .snapshot()
            .into_iter()
            .filter(|t| !doomed.contains(&t.id))
            .collect();
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt { what: e.to_string() })
    }

    /// A pure transformation: applies `updates` to `root` and every
    /// descendant of `root` for which `predicate` holds.
    pub fn update_descendants<F>(
        &self,
        root: &TaskId,
        predicate: F,
        updates: &TaskUpdate,
    ) -> Result<TaskTree, EngineError>
    where
        F: Fn(&Task) -> bool,
    {
        let mut target_ids: std::collections::HashSet<TaskId> = self
            .descendants_of(root)
            .into_iter()
            .filter(|t| predicate(t))
            .map(|t| t.id.clone())
            .collect();
        if let Some(root_task) = self.get(root) {
            if predicate(root_task) {
                target_ids.insert(root.clone());
            }
        }
        let mut tasks = self.snapshot();
        for task in tasks.iter_mut() {
            if target_ids.contains(&task.id) {
                apply_update(task, updates)?;
            }
        }
        TaskTree::build(tasks).map_err(|e| EngineError::Corrupt { what: e.to_string() })
    }

    /// The batch form (§4.4): applies `ops` in order, each against the
    /// tree produced by the previous one.
    pub fn apply_ops(&self, ops: &[TreeOp]) -> Result<TaskTree, EngineError> {
        let mut tree = self.clone();
        for op in ops {
            tree = match op {
                TreeOp::UpdateTask { id, updates } => tree.with_task(id, updates)?,
                TreeOp::BulkStatusUpdate { root, status } => {
                    tree.update_descendants(root, |_| true, &TaskUpdate {
                        status: Some(*status),
                        ..Default::default()
                    })?
                }
            };
        }
        Ok(tree)
    }
}

fn apply_update(task: &mut Task, updates: &TaskUpdate) -> Result<(), EngineError> {
    if let Some(ref parent_id) = updates.parent_id {
        task.parent_id = parent_id.clone();
    }
    if let Some(ref title) = updates.title {
        crate::types::validate_title(title)?;
        task.title = title.clone();
    }
    if let Some(ref description) = updates.description {
        if let Some(ref d) = description {
            crate::types::validate_description(d)?;
        }
        task.description = description.clone();
    }
    if let Some(status) = updates.status {
        task.status = status;
    }
    if let Some(score) = updates.priority_score {
        crate::types::validate_priority_score(score)?;
        task.priority_score = score;
    }
    if let Some(ref prd) = updates.prd {
        task.prd = prd.clone();
    }
    if let Some(ref context_digest) = updates.context_digest {
        task.context_digest = context_digest.clone();
    }
    task.updated_at = chrono::Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_with(id: &str, parent: Option<&str>, status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::from(id),
            parent_id: parent.map(TaskId::from),
            title: format!("task {id}"),
            description: None,
            status,
            priority_score: 50.0,
            prd: None,
            context_digest: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn simple(id: &str, parent: Option<&str>) -> Task {
        task_with(id, parent, TaskStatus::Pending)
    }

    #[test]
    fn build_rejects_duplicate_ids() {
        let err = TaskTree::build(vec![simple("a", None), simple("a", None)]).unwrap_err();
        assert!(matches!(err, TreeBuildError::DuplicateId { .. }));
    }

    #[test]
    fn build_rejects_unknown_parent() {
        let err = TaskTree::build(vec![simple("a", Some("ghost"))]).unwrap_err();
        assert!(matches!(err, TreeBuildError::UnknownParent { .. }));
    }

    #[test]
    fn children_and_parent_navigation() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("child1", Some("root")),
            simple("child2", Some("root")),
        ])
        .unwrap();
        let children: Vec<TaskId> = tree
            .children_of(&TaskId::from("root"))
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(children, vec![TaskId::from("child1"), TaskId::from("child2")]);
        assert_eq!(
            tree.parent_of(&TaskId::from("child1")).unwrap().id,
            TaskId::from("root")
        );
        assert!(tree.parent_of(&TaskId::from("root")).is_none());
    }

    #[test]
    fn path_to_is_root_first() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("mid", Some("root")),
            simple("leaf", Some("mid")),
        ])
        .unwrap();
        let path: Vec<TaskId> = tree
            .path_to(&TaskId::from("leaf"))
            .unwrap()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(
            path,
            vec![TaskId::from("root"), TaskId::from("mid"), TaskId::from("leaf")]
        );
    }

    #[test]
    fn descendants_are_depth_first() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("a", Some("root")),
            simple("b", Some("a")),
            simple("c", Some("root")),
        ])
        .unwrap();
        let ids: Vec<TaskId> = tree
            .descendants_of(&TaskId::from("root"))
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(
            ids,
            vec![
                TaskId::from("a"),
                TaskId::from("b"),
                TaskId::from("c")
            ]
        );
    }

    #[test]
    fn depth_counts_from_root() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("mid", Some("root")),
            simple("leaf", Some("mid")),
        ])
        .unwrap();
        assert_eq!(tree.depth_of(&TaskId::from("root")), Some(0));
        assert_eq!(tree.depth_of(&TaskId::from("leaf")), Some(2));
    }

    #[test]
    fn is_ancestor_of_covers_self_and_proper_ancestors() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("mid", Some("root")),
            simple("leaf", Some("mid")),
        ])
        .unwrap();
        assert!(tree.is_ancestor_of(&TaskId::from("root"), &TaskId::from("leaf")));
        assert!(tree.is_ancestor_of(&TaskId::from("leaf"), &TaskId::from("leaf")));
        assert!(!tree.is_ancestor_of(&TaskId::from("leaf"), &TaskId::from("root")));
    }

    #[test]
    fn effective_status_inherits_done_from_ancestor() {
        let tree = TaskTree::build(vec![
            task_with("root", None, TaskStatus::Done),
            task_with("child", Some("root"), TaskStatus::Pending),
        ])
        .unwrap();
        assert_eq!(
            tree.effective_status(&TaskId::from("child")),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn effective_status_does_not_inherit_blocked_from_ancestor() {
        let tree = TaskTree::build(vec![
            task_with("root", None, TaskStatus::Blocked),
            task_with("child", Some("root"), TaskStatus::InProgress),
        ])
        .unwrap();
        assert_eq!(
            tree.effective_status(&TaskId::from("child")),
            Some(TaskStatus::InProgress)
        );
    }

    #[test]
    fn effective_status_is_own_status_when_no_overriding_ancestor() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            task_with("child", Some("root"), TaskStatus::InProgress),
        ])
        .unwrap();
        assert_eq!(
            tree.effective_status(&TaskId::from("child")),
            Some(TaskStatus::InProgress)
        );
    }

    #[test]
    fn effective_status_prefers_done_over_cancelled_ancestor() {
        let tree = TaskTree::build(vec![
            task_with("root", None, TaskStatus::Cancelled),
            task_with("mid", Some("root"), TaskStatus::Done),
            task_with("leaf", Some("mid"), TaskStatus::Pending),
        ])
        .unwrap();
        assert_eq!(
            tree.effective_status(&TaskId::from("leaf")),
            Some(TaskStatus::Done)
        );
    }

    #[test]
    fn siblings_exclude_self_and_cousins() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("a", Some("root")),
            simple("b", Some("root")),
            simple("c", Some("a")),
        ])
        .unwrap();
        let siblings: Vec<TaskId> = tree
            .siblings_of(&TaskId::from("a"))
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(siblings, vec![TaskId::from("b")]);
        assert!(tree.is_sibling_of(&TaskId::from("a"), &TaskId::from("b")));
        assert!(!tree.is_sibling_of(&TaskId::from("a"), &TaskId::from("c")));
        assert!(!tree.is_sibling_of(&TaskId::from("a"), &TaskId::from("a")));
    }

    #[test]
    fn is_descendant_of_mirrors_is_ancestor_of() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("mid", Some("root")),
            simple("leaf", Some("mid")),
        ])
        .unwrap();
        assert!(tree.is_descendant_of(&TaskId::from("leaf"), &TaskId::from("root")));
        assert!(!tree.is_descendant_of(&TaskId::from("root"), &TaskId::from("leaf")));
    }

    #[test]
    fn descendant_count_excludes_self() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("a", Some("root")),
            simple("b", Some("a")),
        ])
        .unwrap();
        assert_eq!(tree.descendant_count(&TaskId::from("root")), 2);
        assert_eq!(tree.descendant_count(&TaskId::from("b")), 0);
    }

    #[test]
    fn walk_preorder_stop_halts_immediately() {
        let tree = TaskTree::build(vec![
            simple("a", None),
            simple("b", None),
            simple("c", None),
        ])
        .unwrap();
        let mut seen = Vec::new();
        tree.walk_preorder(|t| {
            seen.push(t.id.clone());
            if t.id == TaskId::from("b") {
                TraversalControl::Stop
            } else {
                TraversalControl::Continue
            }
        });
        assert_eq!(seen, vec![TaskId::from("a"), TaskId::from("b")]);
    }

    #[test]
    fn walk_preorder_skip_children_keeps_siblings() {
        let tree = TaskTree::build(vec![
            simple("a", None),
            simple("a1", Some("a")),
            simple("b", None),
        ])
        .unwrap();
        let mut seen = Vec::new();
        tree.walk_preorder(|t| {
            seen.push(t.id.clone());
            if t.id == TaskId::from("a") {
                TraversalControl::SkipChildren
            } else {
                TraversalControl::Continue
            }
        });
        assert_eq!(seen, vec![TaskId::from("a"), TaskId::from("b")]);
    }

    #[test]
    fn walk_breadth_first_visits_level_by_level() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("a", Some("root")),
            simple("b", Some("root")),
            simple("a1", Some("a")),
        ])
        .unwrap();
        let mut seen = Vec::new();
        tree.walk_breadth_first(|t| {
            seen.push(t.id.clone());
            TraversalControl::Continue
        });
        assert_eq!(
            seen,
            vec![
                TaskId::from("root"),
                TaskId::from("a"),
                TaskId::from("b"),
                TaskId::from("a1"),
            ]
        );
    }

    #[test]
    fn find_and_filter_locate_matching_tasks() {
        let tree = TaskTree::build(vec![
            task_with("a", None, TaskStatus::Done),
            task_with("b", None, TaskStatus::Pending),
            task_with("c", None, TaskStatus::Done),
        ])
        .unwrap();
        let found = tree.find(|t| t.status == TaskStatus::Pending).unwrap();
        assert_eq!(found.id, TaskId::from("b"));
        let done: Vec<TaskId> = tree
            .filter(|t| t.status == TaskStatus::Done)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        assert_eq!(done, vec![TaskId::from("a"), TaskId::from("c")]);
    }

    #[test]
    fn with_task_is_pure_and_leaves_original_untouched() {
        let tree = TaskTree::build(vec![simple("a", None)]).unwrap();
        let updated = tree
            .with_task(
                &TaskId::from("a"),
                &TaskUpdate {
                    title: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(tree.get(&TaskId::from("a")).unwrap().title, "task a");
        assert_eq!(updated.get(&TaskId::from("a")).unwrap().title, "renamed");
    }

    #[test]
    fn add_child_rejects_unknown_parent() {
        let tree = TaskTree::build(vec![simple("a", None)]).unwrap();
        let err = tree
            .add_child(Some(TaskId::from("ghost")), simple("b", None))
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphInvariant { .. }));
    }

    #[test]
    fn remove_child_drops_subtree() {
        let tree = TaskTree::build(vec![
            simple("root", None),
            simple("a", Some("root")),
            simple("b", Some("a")),
        ])
        .unwrap();
        let pruned = tree.remove_child(&TaskId::from("a")).unwrap();
        assert_eq!(pruned.len(), 1);
        assert!(pruned.get(&TaskId::from("a")).is_none());
        assert!(pruned.get(&TaskId::from("b")).is_none());
    }

    #[test]
    fn update_descendants_applies_to_matching_subtree() {
        let tree = TaskTree::build(vec![
            task_with("root", None, TaskStatus::Pending),
            task_with("a", Some("root"), TaskStatus::Pending),
            task_with("b", Some("root"), TaskStatus::Done),
        ])
        .unwrap();
        let updated = tree
            .update_descendants(
                &TaskId::from("root"),
                |t| t.status == TaskStatus::Pending,
                &TaskUpdate {
                    status: Some(TaskStatus::Cancelled),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            updated.get(&TaskId::from("root")).unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            updated.get(&TaskId::from("a")).unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(updated.get(&TaskId::from("b")).unwrap().status, TaskStatus::Done);
    }

    #[test]
    fn apply_ops_runs_each_against_the_previous_result() {
        let tree = TaskTree::build(vec![
            task_with("root", None, TaskStatus::Pending),
            task_with("a", Some("root"), TaskStatus::Pending),
        ])
        .unwrap();
        let updated = tree
            .apply_ops(&[
                TreeOp::UpdateTask {
                    id: TaskId::from("root"),
                    updates: TaskUpdate {
                        title: Some("renamed root".to_string()),
                        ..Default::default()
                    },
                },
                TreeOp::BulkStatusUpdate {
                    root: TaskId::from("root"),
                    status: TaskStatus::Cancelled,
                },
            ])
            .unwrap();
        assert_eq!(updated.get(&TaskId::from("root")).unwrap().title, "renamed root");
        assert_eq!(
            updated.get(&TaskId::from("a")).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn preorder_visits_roots_in_order_then_their_subtrees() {
        let tree = TaskTree::build(vec![
            simple("r1", None),
            simple("r1a", Some("r1")),
            simple("r2", None),
        ])
        .unwrap();
        let ids: Vec<TaskId> = tree.iter_preorder().into_iter().map(|t| t.id.clone()).collect();
        assert_eq!(
            ids,
            vec![TaskId::from("r1"), TaskId::from("r1a"), TaskId::from("r2")]
        );
    }
}

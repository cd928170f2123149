//! Dependency edges between tasks.

use serde::{Deserialize, Serialize};

use crate::types::id::TaskId;

/// A directed "depends on" edge: `dependent_id` cannot be considered
/// executable until `dependency_id` reaches [`crate::types::TaskStatus::Done`].
///
/// The pair is ordered and the edge direction is significant -- a
/// `Dependency` is not symmetric, and a graph may hold both
/// `(a, b)` and `(b, a)` only transiently, since adding the second
/// would close a cycle and is rejected by
/// [`crate::graph::DependencyGraph::would_create_cycle`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// The task that is blocked until `dependency_id` completes.
    pub dependent_id: TaskId,
    /// The task that must complete first.
    pub dependency_id: TaskId,
}

impl Dependency {
    /// Builds an edge, rejecting a task depending on itself at construction
    /// time so a self-loop can never enter the graph through this
    /// constructor.
    pub fn new(dependent_id: TaskId, dependency_id: TaskId) -> Result<Self, SelfDependencyError> {
        if dependent_id == dependency_id {
            return Err(SelfDependencyError(dependent_id));
        }
        Ok(Self {
            dependent_id,
            dependency_id,
        })
    }
}

/// A task cannot depend on itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfDependencyError(pub TaskId);

impl std::fmt::Display for SelfDependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {} cannot depend on itself", self.0)
    }
}

impl std::error::Error for SelfDependencyError {}

//! Physical tasks and graphs: one logical graph instantiated for a session.

use std::sync::Arc;

use flowgrid_core::{ExecutionId, Grant, LogicalGraph, LogicalTask, NodeId, SessionId, TaskRef};
use serde::{Deserialize, Serialize};

use crate::state::{FailureKind, TaskState};

/// Why a task ended up FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub reason: String,
    /// Epoch milliseconds.
    pub at: u64,
}

/// Readiness bookkeeping for a started task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessInfo {
    pub checks: u32,
    pub errors: u32,
    pub last_error: Option<String>,
}

/// A logical task instantiated for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalTask {
    pub id: TaskRef,
    /// Declaration index in the logical graph.
    pub index: usize,
    pub state: TaskState,
    /// Resources bound to the task, once assigned.
    pub grant: Option<Grant>,
    pub node: Option<NodeId>,
    pub execution_id: Option<ExecutionId>,
    /// Consecutive launch rejections.
    pub attempts: u32,
    /// Epoch ms before which the task must not be placed again.
    pub not_before: u64,
    pub failure: Option<FailureRecord>,
    pub readiness: ReadinessInfo,
    /// A readiness result arrived before the Running status.
    pub buffered_ready: bool,
    /// The task must be stopped (session stop or failed dependency).
    pub stop_requested: bool,
}

impl PhysicalTask {
    fn new(session: &SessionId, index: usize, logical: &LogicalTask) -> Self {
        Self {
            id: TaskRef::new(session.clone(), logical.id.clone()),
            index,
            state: TaskState::Pending,
            grant: None,
            node: None,
            execution_id: None,
            attempts: 0,
            not_before: 0,
            failure: None,
            readiness: ReadinessInfo::default(),
            buffered_ready: false,
            stop_requested: false,
        }
    }

    /// The task occupies (or will occupy) its node.
    pub fn holds_node(&self) -> bool {
        self.node.is_some() && !self.state.is_terminal()
    }
}

/// A logical graph instantiated for one session. Owns its tasks.
#[derive(Debug, Clone)]
pub struct PhysicalGraph {
    logical: Arc<LogicalGraph>,
    tasks: Vec<PhysicalTask>,
}

impl PhysicalGraph {
    pub fn new(session: &SessionId, logical: Arc<LogicalGraph>) -> Self {
        let tasks = logical
            .tasks()
            .iter()
            .enumerate()
            .map(|(i, t)| PhysicalTask::new(session, i, t))
            .collect();
        Self { logical, tasks }
    }

    pub fn logical(&self) -> &LogicalGraph {
        &self.logical
    }

    pub fn tasks(&self) -> &[PhysicalTask] {
        &self.tasks
    }

    pub fn task(&self, idx: usize) -> &PhysicalTask {
        &self.tasks[idx]
    }

    pub fn task_mut(&mut self, idx: usize) -> &mut PhysicalTask {
        &mut self.tasks[idx]
    }

    pub fn index_of(&self, task: &str) -> Option<usize> {
        self.logical.index_of(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Every `depends_on` predecessor of `idx` is READY.
    pub fn dependencies_ready(&self, idx: usize) -> bool {
        self.logical
            .predecessors(idx)
            .iter()
            .all(|&p| self.tasks[p].state == TaskState::Ready)
    }

    /// Every dependent of `idx` is DEAD or FAILED, so `idx` may be killed.
    pub fn dependents_done(&self, idx: usize) -> bool {
        self.logical
            .dependents(idx)
            .iter()
            .all(|&d| self.tasks[d].state.is_terminal())
    }

    /// Node shared by already-bound members of `idx`'s co-location class.
    pub fn pinned_node(&self, idx: usize) -> Option<NodeId> {
        let class = self.logical.colocation_class(idx)?;
        self.logical.colocation_classes()[class]
            .iter()
            .filter(|&&m| m != idx)
            .find_map(|&m| {
                let peer = &self.tasks[m];
                peer.holds_node().then(|| peer.node.clone()).flatten()
            })
    }

    /// Nodes held by anti-co-located peers of `idx`, sorted and unique.
    pub fn excluded_nodes(&self, idx: usize) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .logical
            .anti_colocated(idx)
            .iter()
            .filter_map(|&p| {
                let peer = &self.tasks[p];
                peer.holds_node().then(|| peer.node.clone()).flatten()
            })
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> PhysicalGraph {
        let logical = LogicalGraph::new(
            "g",
            "1",
            vec![
                LogicalTask::new("a"),
                LogicalTask::new("b").depends_on("a").colocate_with("c"),
                LogicalTask::new("c").anti_colocate_with("a"),
            ],
        )
        .unwrap();
        PhysicalGraph::new(&"s1".to_string(), Arc::new(logical))
    }

    #[test]
    fn tasks_start_pending() {
        let g = graph();
        assert_eq!(g.len(), 3);
        assert!(g.tasks().iter().all(|t| t.state == TaskState::Pending));
        assert_eq!(g.task(1).id, TaskRef::new("s1", "b"));
    }

    #[test]
    fn dependency_and_kill_gates() {
        let mut g = graph();
        assert!(!g.dependencies_ready(1));
        assert!(!g.dependents_done(0));

        g.task_mut(0).state = TaskState::Ready;
        assert!(g.dependencies_ready(1));

        g.task_mut(1).state = TaskState::Failed;
        assert!(g.dependents_done(0));
    }

    #[test]
    fn placement_constraints_follow_bound_peers() {
        let mut g = graph();
        assert_eq!(g.pinned_node(1), None);

        g.task_mut(2).node = Some("n2".into());
        g.task_mut(2).state = TaskState::Started;
        g.task_mut(0).node = Some("n1".into());
        g.task_mut(0).state = TaskState::Ready;

        assert_eq!(g.pinned_node(1).as_deref(), Some("n2"));
        assert_eq!(g.excluded_nodes(2), vec!["n1".to_string()]);

        g.task_mut(0).state = TaskState::Dead;
        assert!(g.excluded_nodes(2).is_empty());
    }
}

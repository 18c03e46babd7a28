//! The allocation pass.
//!
//! One pass takes the offer pool and every pending task across all
//! sessions and greedily assigns tasks to nodes:
//!
//! 1. Expired offers are dropped before matching.
//! 2. Tasks are stably ordered: dependency-ready first, then declaration
//!    index, then session sequence number, then task reference. Ordering by
//!    declaration index before session interleaves sessions.
//! 3. A co-location class is placed at the position of its first member, as
//!    one combined request. Candidate nodes are ranked best-fit on the
//!    combined request; members are then carved out one by one and the
//!    search moves to the next node if any member does not fit. No node
//!    means no member is placed.
//! 4. Consumed resources leave the pool before the next task is considered.
//!
//! Tasks that find no node are reported as unsatisfiable and simply stay
//! pending. Given the same pool and the same pending set the outcome is
//! identical.

use std::collections::{BTreeSet, HashMap, HashSet};

use flowgrid_core::{Grant, NodeId, Offer, ResourceRequest, SessionId, TaskId, TaskRef};
use serde::Serialize;
use tracing::debug;

use crate::pool::OfferPool;
use crate::scorer::rank_nodes;

/// A task waiting for resources.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub task: TaskRef,
    pub request: ResourceRequest,
    /// All `depends_on` predecessors are READY.
    pub dependency_ready: bool,
    /// Position of the task in its logical graph.
    pub declaration_index: usize,
    /// Creation order of the owning session.
    pub session_seq: u64,
    /// Co-location class within the session's graph.
    pub colocation: Option<usize>,
    /// Node the task must use because class peers already run there.
    pub pinned_node: Option<NodeId>,
    /// Nodes the task must avoid because anti-co-located peers run there.
    pub excluded_nodes: Vec<NodeId>,
    /// Anti-co-located peers in the same session that may be placed in
    /// this very pass.
    pub anti_colocated: Vec<TaskId>,
    /// Epoch ms before which the task must not be placed (launch backoff).
    pub not_before: u64,
}

impl PendingTask {
    pub fn new(task: TaskRef, request: ResourceRequest) -> Self {
        Self {
            task,
            request,
            dependency_ready: true,
            declaration_index: 0,
            session_seq: 0,
            colocation: None,
            pinned_node: None,
            excluded_nodes: Vec::new(),
            anti_colocated: Vec::new(),
            not_before: 0,
        }
    }

    pub fn with_dependency_ready(mut self, ready: bool) -> Self {
        self.dependency_ready = ready;
        self
    }

    pub fn with_declaration_index(mut self, index: usize) -> Self {
        self.declaration_index = index;
        self
    }

    pub fn with_session_seq(mut self, seq: u64) -> Self {
        self.session_seq = seq;
        self
    }

    pub fn with_colocation(mut self, class: usize) -> Self {
        self.colocation = Some(class);
        self
    }

    pub fn pinned_to(mut self, node: impl Into<NodeId>) -> Self {
        self.pinned_node = Some(node.into());
        self
    }

    pub fn excluding(mut self, node: impl Into<NodeId>) -> Self {
        self.excluded_nodes.push(node.into());
        self
    }

    pub fn anti_colocated_with(mut self, task: impl Into<TaskId>) -> Self {
        self.anti_colocated.push(task.into());
        self
    }

    pub fn not_before(mut self, at: u64) -> Self {
        self.not_before = at;
        self
    }

    fn sort_key(&self) -> (bool, usize, u64, &TaskRef) {
        (
            !self.dependency_ready,
            self.declaration_index,
            self.session_seq,
            &self.task,
        )
    }

    fn class_key(&self) -> Option<(&SessionId, usize)> {
        self.colocation.map(|c| (&self.task.session, c))
    }
}

/// One task bound to concrete resources on one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub task: TaskRef,
    pub grant: Grant,
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocationOutcome {
    pub assignments: Vec<Assignment>,
    /// No node could hold these tasks this pass. They stay pending.
    pub unsatisfiable: Vec<TaskRef>,
    /// Skipped because their launch backoff has not elapsed.
    pub deferred: Vec<TaskRef>,
}

impl AllocationOutcome {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.unsatisfiable.is_empty() && self.deferred.is_empty()
    }

    pub fn grant_for(&self, task: &TaskRef) -> Option<&Grant> {
        self.assignments
            .iter()
            .find(|a| &a.task == task)
            .map(|a| &a.grant)
    }
}

/// Nodes placed in this pass, per task.
type Placed = HashMap<TaskRef, NodeId>;

fn exclusions<'a>(tasks: impl IntoIterator<Item = &'a PendingTask>, placed: &Placed) -> BTreeSet<NodeId> {
    let mut out = BTreeSet::new();
    for task in tasks {
        out.extend(task.excluded_nodes.iter().cloned());
        for peer in &task.anti_colocated {
            let peer = TaskRef::new(task.task.session.clone(), peer.clone());
            if let Some(node) = placed.get(&peer) {
                out.insert(node.clone());
            }
        }
    }
    out
}

/// Run one allocation pass against `pool`, consuming what is assigned.
pub fn allocate(pool: &mut OfferPool, pending: &[PendingTask], now: u64) -> AllocationOutcome {
    let expired = pool.drop_expired(now);
    if !expired.is_empty() {
        debug!(count = expired.len(), "dropped expired offers before matching");
    }

    let mut order: Vec<&PendingTask> = pending.iter().collect();
    order.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut outcome = AllocationOutcome::default();
    let mut placed: Placed = HashMap::new();
    let mut seen_classes: HashSet<(&SessionId, usize)> = HashSet::new();

    for task in &order {
        if task.not_before > now {
            outcome.deferred.push(task.task.clone());
            continue;
        }
        match task.class_key() {
            Some(key) => {
                if !seen_classes.insert(key) {
                    continue;
                }
                let members: Vec<&PendingTask> = order
                    .iter()
                    .copied()
                    .filter(|m| m.class_key() == Some(key) && m.not_before <= now)
                    .collect();
                place_class(pool, &members, &mut placed, &mut outcome);
            }
            None => place_single(pool, task, &mut placed, &mut outcome),
        }
    }

    debug!(
        assigned = outcome.assignments.len(),
        unsatisfiable = outcome.unsatisfiable.len(),
        deferred = outcome.deferred.len(),
        "allocation pass complete"
    );
    outcome
}

fn place_single(pool: &mut OfferPool, task: &PendingTask, placed: &mut Placed, outcome: &mut AllocationOutcome) {
    let excluded = exclusions([task], placed);
    let candidates = pool.nodes().filter(|n| {
        task.pinned_node.as_deref().is_none_or(|p| p == n.node()) && !excluded.contains(n.node())
    });
    let ranked = rank_nodes(candidates, &task.request);

    for candidate in ranked {
        match pool.acquire(&candidate.node, &task.request) {
            Ok(grant) => {
                debug!(task = %task.task, node = %candidate.node, leftover = candidate.leftover, "assigned task");
                placed.insert(task.task.clone(), candidate.node.clone());
                outcome.assignments.push(Assignment {
                    task: task.task.clone(),
                    grant,
                });
                return;
            }
            Err(reason) => {
                debug!(task = %task.task, node = %candidate.node, %reason, "ranked node refused task");
            }
        }
    }
    outcome.unsatisfiable.push(task.task.clone());
}

fn place_class(
    pool: &mut OfferPool,
    members: &[&PendingTask],
    placed: &mut Placed,
    outcome: &mut AllocationOutcome,
) {
    let combined = ResourceRequest::combine(members.iter().map(|m| &m.request));
    let pinned: Option<NodeId> = members.iter().find_map(|m| m.pinned_node.clone());
    let excluded = exclusions(members.iter().copied(), placed);
    let candidates = pool.nodes().filter(|n| {
        pinned.as_deref().is_none_or(|p| p == n.node()) && !excluded.contains(n.node())
    });
    let ranked = rank_nodes(candidates, &combined);
    let requests: Vec<&ResourceRequest> = members.iter().map(|m| &m.request).collect();

    for candidate in ranked {
        match pool.acquire_all(&candidate.node, &requests) {
            Ok(grants) => {
                debug!(
                    node = %candidate.node,
                    members = members.len(),
                    "assigned co-location class"
                );
                for (member, grant) in members.iter().zip(grants) {
                    placed.insert(member.task.clone(), candidate.node.clone());
                    outcome.assignments.push(Assignment {
                        task: member.task.clone(),
                        grant,
                    });
                }
                return;
            }
            Err(reason) => {
                debug!(node = %candidate.node, %reason, "class members do not fit individually, backtracking");
            }
        }
    }

    debug!(members = members.len(), "co-location class unsatisfiable this pass");
    outcome
        .unsatisfiable
        .extend(members.iter().map(|m| m.task.clone()));
}

/// Allocate against a private pool built from `offers`.
pub fn plan(offers: &[Offer], pending: &[PendingTask], now: u64) -> AllocationOutcome {
    let mut pool = OfferPool::new();
    pool.add_batch(offers.iter().cloned(), now);
    allocate(&mut pool, pending, now)
}

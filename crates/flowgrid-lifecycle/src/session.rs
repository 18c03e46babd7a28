//! Session controller — the per-session task state machine.
//!
//! A [`Session`] owns one [`PhysicalGraph`] and is its only writer. It is a
//! pure state machine: every input (assignment, launch outcome, cluster
//! status, readiness result, stop request) returns the [`Effect`]s the
//! caller must carry out. No I/O happens here, which keeps every ordering
//! rule testable without a cluster.
//!
//! Ordering rules enforced here:
//! - a task is launched only once all of its `depends_on` predecessors are
//!   READY;
//! - a task is killed only once all of its dependents are DEAD or FAILED;
//! - STARTED is never skipped: a readiness result that arrives before the
//!   Running status is buffered until the task is STARTED.

use std::sync::Arc;

use flowgrid_core::{
    ExecutionId, FailurePolicy, Grant, LaunchDescriptor, LogicalGraph, NodeId, SessionId, TaskId,
    TaskRef,
};
use flowgrid_health::{ReadinessOutcome, TaskHandle};
use flowgrid_placement::PendingTask;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::physical::{FailureRecord, PhysicalGraph, PhysicalTask, ReadinessInfo};
use crate::policy::{RejectionDecision, SessionPolicy};
use crate::state::{ExecutionState, ExecutionStatus, FailureKind, SessionState, TaskState};
use crate::telemetry::{Transition, TransitionEvent};

/// What a session asks the cluster framework to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub task: TaskRef,
    pub node: NodeId,
    pub grant: Grant,
    pub launch: LaunchDescriptor,
}

/// Side effects requested by a session transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Insert or refresh the task's entry in the shared pending queue.
    PublishPending(PendingTask),
    /// Remove the task from the shared pending queue.
    WithdrawPending(TaskRef),
    Launch(LaunchRequest),
    Kill {
        task: TaskRef,
        execution_id: ExecutionId,
    },
    /// Return unused resources to the offer pool.
    ReleaseGrant(Grant),
    WatchReadiness(TaskHandle),
    StopReadiness(TaskRef),
    Telemetry(TransitionEvent),
}

/// A task that may have a process on the cluster, for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTask {
    pub task: TaskRef,
    pub state: TaskState,
    pub execution_id: Option<ExecutionId>,
}

/// Per-task detail in a [`SessionStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task: TaskId,
    pub state: TaskState,
    pub required: bool,
    pub node: Option<NodeId>,
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    pub attempts: u32,
    pub readiness: ReadinessInfo,
    pub failure: Option<FailureRecord>,
}

/// One line of a session's failure summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub task: TaskId,
    pub kind: FailureKind,
    pub reason: String,
}

/// Aggregated session state plus per-task detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub name: String,
    pub graph: String,
    pub version: String,
    pub state: SessionState,
    pub created_at: u64,
    pub tasks: Vec<TaskStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureSummary>,
}

impl SessionStatus {
    pub fn task(&self, id: &str) -> Option<&TaskStatus> {
        self.tasks.iter().find(|t| t.task == id)
    }
}

/// One physical-graph instance and its lifecycle.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    name: String,
    seq: u64,
    created_at: u64,
    graph: PhysicalGraph,
    policy: SessionPolicy,
    stopping: bool,
    stop_reason: Option<String>,
    state: SessionState,
}

impl Session {
    pub fn new(
        id: impl Into<SessionId>,
        name: impl Into<String>,
        seq: u64,
        logical: Arc<LogicalGraph>,
        policy: SessionPolicy,
        now: u64,
    ) -> Self {
        let id = id.into();
        let graph = PhysicalGraph::new(&id, logical);
        Self {
            id,
            name: name.into(),
            seq,
            created_at: now,
            graph,
            policy,
            stopping: false,
            stop_reason: None,
            state: SessionState::Building,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn graph(&self) -> &PhysicalGraph {
        &self.graph
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn task(&self, id: &str) -> Option<&PhysicalTask> {
        self.graph.index_of(id).map(|i| self.graph.task(i))
    }

    pub fn task_state(&self, id: &str) -> Option<TaskState> {
        self.task(id).map(|t| t.state)
    }

    // ── Inputs ────────────────────────────────────────────────────

    /// Publish every task to the pending queue.
    pub fn start(&mut self, now: u64) -> Vec<Effect> {
        let mut fx = Vec::new();
        for &idx in self.graph.logical().topological_order() {
            fx.push(Effect::PublishPending(self.pending_entry(idx)));
        }
        info!(session = %self.id, name = %self.name, tasks = self.graph.len(), "session started");
        self.finish(now, fx)
    }

    /// The allocator bound resources to a task.
    pub fn on_assignment(&mut self, task: &str, grant: Grant, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            warn!(session = %self.id, %task, "assignment for unknown task");
            return vec![Effect::ReleaseGrant(grant)];
        };
        let t = self.graph.task(idx);
        if t.state != TaskState::Pending || t.grant.is_some() || t.stop_requested {
            debug!(session = %self.id, %task, state = %t.state, "discarding stale assignment");
            return vec![Effect::ReleaseGrant(grant)];
        }

        let mut fx = Vec::new();
        let node = grant.node.clone();
        debug!(session = %self.id, %task, %node, "task assigned");
        {
            let t = self.graph.task_mut(idx);
            t.node = Some(node);
            t.grant = Some(grant);
        }

        // Anti-co-located peers still waiting must now avoid this node.
        let peers: Vec<usize> = self.graph.logical().anti_colocated(idx).to_vec();
        for p in peers {
            let peer = self.graph.task(p);
            if peer.state == TaskState::Pending && peer.grant.is_none() && !peer.stop_requested {
                fx.push(Effect::PublishPending(self.pending_entry(p)));
            }
        }

        if self.graph.dependencies_ready(idx) {
            self.launch(idx, now, &mut fx);
        }
        self.finish(now, fx)
    }

    /// The framework accepted a launch and assigned an execution id.
    pub fn on_launch_accepted(&mut self, task: &str, execution_id: ExecutionId, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let t = self.graph.task_mut(idx);
        let owns = match &t.execution_id {
            None => t.state == TaskState::Starting,
            Some(current) => *current == execution_id,
        };
        if !owns {
            warn!(session = %self.id, %task, %execution_id, "launch accepted for a task that moved on, killing orphan");
            let task = t.id.clone();
            return vec![Effect::Kill { task, execution_id }];
        }
        t.execution_id = Some(execution_id);
        self.finish(now, Vec::new())
    }

    /// The framework refused a launch synchronously.
    pub fn on_launch_rejected(&mut self, task: &str, reason: &str, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let t = self.graph.task_mut(idx);
        if t.state != TaskState::Starting || t.execution_id.is_some() {
            debug!(session = %self.id, %task, "ignoring stale launch rejection");
            return Vec::new();
        }
        let mut fx = Vec::new();
        if let Some(grant) = t.grant.take() {
            fx.push(Effect::ReleaseGrant(grant));
        }
        self.handle_rejection(idx, reason, now, &mut fx);
        self.finish(now, fx)
    }

    /// An offer backing the task's grant left the pool before the launch
    /// went out. The task was never refused, so it goes back to PENDING
    /// without spending a launch attempt.
    pub fn on_grant_lost(&mut self, task: &str, reason: &str, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let t = self.graph.task_mut(idx);
        if t.state != TaskState::Starting || t.execution_id.is_some() {
            debug!(session = %self.id, %task, state = %t.state, "ignoring stale grant loss");
            return Vec::new();
        }
        let mut fx = Vec::new();
        if let Some(grant) = t.grant.take() {
            fx.push(Effect::ReleaseGrant(grant));
        }
        t.node = None;
        t.buffered_ready = false;
        let stop_requested = t.stop_requested;
        info!(session = %self.id, %task, %reason, "granted offer is gone, task back to pending");
        self.transition(idx, TaskState::Pending, Some(reason.to_string()), now, &mut fx);
        if !stop_requested {
            fx.push(Effect::PublishPending(self.pending_entry(idx)));
        }
        self.finish(now, fx)
    }

    /// A status update from the cluster framework.
    pub fn on_status(&mut self, status: &ExecutionStatus, now: u64) -> Vec<Effect> {
        if status.task.session != self.id {
            return Vec::new();
        }
        let Some(idx) = self.graph.index_of(&status.task.task) else {
            debug!(session = %self.id, task = %status.task, "status for unknown task");
            return Vec::new();
        };

        let mut fx = Vec::new();
        let t = self.graph.task_mut(idx);
        match t.execution_id.clone() {
            Some(current) if current != status.execution_id => {
                debug!(task = %t.id, execution_id = %status.execution_id, "discarding status of stale execution");
                if !status.state.is_terminal() {
                    fx.push(Effect::Kill {
                        task: t.id.clone(),
                        execution_id: status.execution_id.clone(),
                    });
                }
                return fx;
            }
            None if t.state == TaskState::Starting => {
                // Status overtook the launch acknowledgement.
                t.execution_id = Some(status.execution_id.clone());
            }
            None => {
                debug!(task = %t.id, state = %t.state, "discarding status for task without execution");
                if !status.state.is_terminal() {
                    fx.push(Effect::Kill {
                        task: t.id.clone(),
                        execution_id: status.execution_id.clone(),
                    });
                }
                return fx;
            }
            Some(_) => {}
        }

        let reason = status
            .reason
            .clone()
            .unwrap_or_else(|| format!("execution {:?}", status.state));
        match (t.state, status.state) {
            (_, ExecutionState::Staging | ExecutionState::Starting | ExecutionState::Killing) => {}
            (TaskState::Starting, ExecutionState::Running) => self.mark_started(idx, now, &mut fx),
            (_, ExecutionState::Running) => {
                debug!(task = %t.id, state = %t.state, "discarding duplicate or backward Running");
            }
            (TaskState::Starting, s) if s.is_launch_failure() => {
                // The framework consumed the offer; nothing to release.
                t.grant = None;
                self.handle_rejection(idx, &reason, now, &mut fx);
            }
            (TaskState::Killing, _) => self.transition(idx, TaskState::Dead, Some(reason), now, &mut fx),
            (TaskState::Starting | TaskState::Started | TaskState::Ready, _) => {
                if t.stop_requested {
                    self.terminate_quietly(idx, reason, now, &mut fx);
                } else {
                    self.fail(idx, FailureKind::UnexpectedTermination, reason, now, &mut fx);
                }
            }
            (TaskState::Pending | TaskState::Dead | TaskState::Failed, _) => {
                debug!(task = %t.id, state = %t.state, "discarding status for finished task");
            }
        }
        self.finish(now, fx)
    }

    /// A readiness check result.
    pub fn on_readiness(&mut self, task: &str, outcome: &ReadinessOutcome, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let mut fx = Vec::new();
        let t = self.graph.task_mut(idx);
        if !matches!(t.state, TaskState::Starting | TaskState::Started) {
            return fx;
        }
        t.readiness.checks += 1;
        match outcome {
            ReadinessOutcome::Ready if t.state == TaskState::Started => {
                fx.push(Effect::StopReadiness(t.id.clone()));
                self.mark_ready(idx, now, &mut fx);
            }
            ReadinessOutcome::Ready => {
                debug!(task = %t.id, "buffering readiness until the task is started");
                t.buffered_ready = true;
            }
            ReadinessOutcome::NotReady => {}
            ReadinessOutcome::Error(message) => {
                t.readiness.errors += 1;
                t.readiness.last_error = Some(message.clone());
                debug!(task = %t.id, error = %message, "readiness check error");
            }
        }
        self.finish(now, fx)
    }

    /// Cooperative stop: pending tasks die at once, running tasks are
    /// killed in reverse dependency order.
    pub fn stop(&mut self, reason: &str, now: u64) -> Vec<Effect> {
        self.request_stop(reason);
        self.finish(now, Vec::new())
    }

    /// Kill every live execution now, ignoring dependency order.
    pub fn force_stop(&mut self, now: u64) -> Vec<Effect> {
        self.request_stop("forced stop");
        let mut fx = Vec::new();
        for idx in 0..self.graph.len() {
            let t = self.graph.task(idx);
            let Some(execution_id) = t.execution_id.clone() else {
                continue;
            };
            let was_started = t.state == TaskState::Started;
            if !matches!(
                t.state,
                TaskState::Starting | TaskState::Started | TaskState::Ready | TaskState::Killing
            ) {
                continue;
            }
            let task = t.id.clone();
            if was_started {
                fx.push(Effect::StopReadiness(task.clone()));
            }
            self.transition(idx, TaskState::Killing, Some("forced stop".into()), now, &mut fx);
            fx.push(Effect::Kill { task, execution_id });
        }
        warn!(session = %self.id, "forced stop issued");
        self.finish(now, fx)
    }

    // ── Reconciliation ────────────────────────────────────────────

    /// Tasks that may have a process on the cluster.
    pub fn live_tasks(&self) -> Vec<LiveTask> {
        self.graph
            .tasks()
            .iter()
            .filter(|t| t.state.is_live())
            .map(|t| LiveTask {
                task: t.id.clone(),
                state: t.state,
                execution_id: t.execution_id.clone(),
            })
            .collect()
    }

    /// The cluster no longer runs the task's execution.
    pub fn reconcile_terminated(&mut self, task: &str, reason: &str, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let mut fx = Vec::new();
        let t = self.graph.task(idx);
        match t.state {
            TaskState::Killing => {
                self.transition(idx, TaskState::Dead, Some(reason.to_string()), now, &mut fx);
            }
            TaskState::Starting | TaskState::Started | TaskState::Ready => {
                warn!(session = %self.id, %task, state = %t.state, %reason, "reconciliation: task is gone");
                if t.stop_requested {
                    self.terminate_quietly(idx, reason.to_string(), now, &mut fx);
                } else {
                    self.fail(idx, FailureKind::UnexpectedTermination, reason.to_string(), now, &mut fx);
                }
            }
            _ => {}
        }
        self.finish(now, fx)
    }

    /// The cluster runs an execution the session lost track of.
    pub fn reconcile_adopt(
        &mut self,
        task: &str,
        execution_id: ExecutionId,
        state: ExecutionState,
        now: u64,
    ) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let t = self.graph.task(idx);
        info!(session = %self.id, %task, %execution_id, ?state, "reconciliation: adopting reported execution");
        let status = ExecutionStatus::new(execution_id, t.id.clone(), state);
        self.on_status(&status, now)
    }

    /// A launch whose outcome was lost with the connection.
    pub fn reconcile_launch_lost(&mut self, task: &str, now: u64) -> Vec<Effect> {
        let Some(idx) = self.graph.index_of(task) else {
            return Vec::new();
        };
        let t = self.graph.task_mut(idx);
        if t.state != TaskState::Starting || t.execution_id.is_some() {
            return Vec::new();
        }
        t.grant = None;
        let mut fx = Vec::new();
        self.handle_rejection(idx, "launch outcome lost in disconnect", now, &mut fx);
        self.finish(now, fx)
    }

    // ── Status ────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        let logical = self.graph.logical();
        let tasks: Vec<TaskStatus> = self
            .graph
            .tasks()
            .iter()
            .map(|t| TaskStatus {
                task: t.id.task.clone(),
                state: t.state,
                required: logical.task(t.index).required,
                node: t.node.clone(),
                execution_id: t.execution_id.clone(),
                ports: t.grant.as_ref().map(Grant::ports).unwrap_or_default(),
                attempts: t.attempts,
                readiness: t.readiness.clone(),
                failure: t.failure.clone(),
            })
            .collect();
        let failures = tasks
            .iter()
            .filter_map(|t| {
                t.failure.as_ref().map(|f| FailureSummary {
                    task: t.task.clone(),
                    kind: f.kind,
                    reason: f.reason.clone(),
                })
            })
            .collect();
        SessionStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            graph: logical.name().to_string(),
            version: logical.version().to_string(),
            state: self.state,
            created_at: self.created_at,
            tasks,
            failures,
        }
    }

    // ── Internals ─────────────────────────────────────────────────

    fn pending_entry(&self, idx: usize) -> PendingTask {
        let logical = self.graph.logical();
        let t = self.graph.task(idx);
        PendingTask {
            task: t.id.clone(),
            request: logical.task(idx).request.clone(),
            dependency_ready: self.graph.dependencies_ready(idx),
            declaration_index: idx,
            session_seq: self.seq,
            colocation: logical.colocation_class(idx),
            pinned_node: self.graph.pinned_node(idx),
            excluded_nodes: self.graph.excluded_nodes(idx),
            anti_colocated: logical
                .anti_colocated(idx)
                .iter()
                .map(|&p| logical.task(p).id.clone())
                .collect(),
            not_before: t.not_before,
        }
    }

    fn transition(&mut self, idx: usize, to: TaskState, reason: Option<String>, now: u64, fx: &mut Vec<Effect>) {
        let t = self.graph.task_mut(idx);
        let from = t.state;
        if from == to {
            return;
        }
        t.state = to;
        debug!(session = %self.id, task = %t.id.task, %from, %to, "task transition");
        fx.push(Effect::Telemetry(TransitionEvent {
            session: self.id.clone(),
            at: now,
            transition: Transition::Task {
                task: t.id.task.clone(),
                from,
                to,
            },
            reason,
        }));
    }

    fn launch(&mut self, idx: usize, now: u64, fx: &mut Vec<Effect>) {
        let t = self.graph.task(idx);
        let (Some(grant), Some(node)) = (t.grant.clone(), t.node.clone()) else {
            return;
        };
        let request = LaunchRequest {
            task: t.id.clone(),
            node,
            grant,
            launch: self.graph.logical().task(idx).launch.clone(),
        };
        self.transition(idx, TaskState::Starting, None, now, fx);
        fx.push(Effect::Launch(request));
    }

    fn handle_rejection(&mut self, idx: usize, reason: &str, now: u64, fx: &mut Vec<Effect>) {
        let t = self.graph.task_mut(idx);
        t.attempts += 1;
        t.execution_id = None;
        t.grant = None;
        t.node = None;
        t.buffered_ready = false;
        let attempts = t.attempts;

        if t.stop_requested {
            self.transition(idx, TaskState::Dead, Some("stopped before start".into()), now, fx);
            return;
        }

        match self.policy.on_rejection(attempts, now) {
            RejectionDecision::Retry { not_before } => {
                warn!(
                    session = %self.id,
                    task = %self.graph.task(idx).id.task,
                    attempt = attempts,
                    max = self.policy.max_launch_attempts,
                    %reason,
                    "launch rejected, retrying after backoff"
                );
                self.graph.task_mut(idx).not_before = not_before;
                self.transition(idx, TaskState::Pending, Some(reason.to_string()), now, fx);
                fx.push(Effect::PublishPending(self.pending_entry(idx)));
            }
            RejectionDecision::GiveUp => {
                let reason = format!("launch rejected {attempts} times: {reason}");
                self.fail(idx, FailureKind::LaunchRejected, reason, now, fx);
            }
        }
    }

    fn mark_started(&mut self, idx: usize, now: u64, fx: &mut Vec<Effect>) {
        self.transition(idx, TaskState::Started, None, now, fx);
        let t = self.graph.task(idx);
        let descriptor = self.graph.logical().task(idx).readiness.clone();
        if descriptor.is_immediate() || t.buffered_ready {
            self.mark_ready(idx, now, fx);
            return;
        }
        let (Some(node), Some(execution_id)) = (t.node.clone(), t.execution_id.clone()) else {
            return;
        };
        fx.push(Effect::WatchReadiness(TaskHandle {
            task: t.id.clone(),
            host: node.clone(),
            node,
            ports: t.grant.as_ref().map(Grant::ports).unwrap_or_default(),
            execution_id,
            descriptor,
        }));
    }

    fn mark_ready(&mut self, idx: usize, now: u64, fx: &mut Vec<Effect>) {
        self.graph.task_mut(idx).buffered_ready = false;
        self.transition(idx, TaskState::Ready, None, now, fx);

        let dependents: Vec<usize> = self.graph.logical().dependents(idx).to_vec();
        for d in dependents {
            let dep = self.graph.task(d);
            if dep.state != TaskState::Pending || dep.stop_requested {
                continue;
            }
            if dep.grant.is_some() {
                if self.graph.dependencies_ready(d) {
                    self.launch(d, now, fx);
                }
            } else {
                fx.push(Effect::PublishPending(self.pending_entry(d)));
            }
        }
    }

    /// A doomed task ended before its kill was issued.
    fn terminate_quietly(&mut self, idx: usize, reason: String, now: u64, fx: &mut Vec<Effect>) {
        if self.graph.task(idx).state == TaskState::Started {
            fx.push(Effect::StopReadiness(self.graph.task(idx).id.clone()));
        }
        self.transition(idx, TaskState::Dead, Some(reason), now, fx);
    }

    fn fail(&mut self, idx: usize, kind: FailureKind, reason: String, now: u64, fx: &mut Vec<Effect>) {
        let t = self.graph.task_mut(idx);
        let was_started = t.state == TaskState::Started;
        t.failure = Some(FailureRecord {
            kind,
            reason: reason.clone(),
            at: now,
        });
        let task_ref = t.id.clone();
        if was_started {
            fx.push(Effect::StopReadiness(task_ref.clone()));
        }
        warn!(session = %self.id, task = %task_ref.task, %kind, %reason, "task failed");
        self.transition(idx, TaskState::Failed, Some(reason), now, fx);

        match self.policy.failure {
            FailurePolicy::AbortSession => {
                self.request_stop(&format!("task {} failed: {kind}", task_ref.task));
            }
            FailurePolicy::AbortSubtree => {
                let descendants = self.graph.logical().descendants(idx);
                if self.stop_reason.is_none() {
                    self.stop_reason = Some(format!("task {} failed: {kind}", task_ref.task));
                }
                if !descendants.is_empty() {
                    info!(session = %self.id, task = %task_ref.task, count = descendants.len(), "stopping dependents of failed task");
                }
                for d in descendants {
                    let dep = self.graph.task_mut(d);
                    if dep.state.is_terminal() || dep.stop_requested {
                        continue;
                    }
                    dep.stop_requested = true;
                    dep.failure = Some(FailureRecord {
                        kind: FailureKind::DependencyFailed,
                        reason: format!("depends on failed task {}", task_ref.task),
                        at: now,
                    });
                }
            }
        }
    }

    fn request_stop(&mut self, reason: &str) {
        if !self.stopping {
            info!(session = %self.id, %reason, "session stopping");
            self.stopping = true;
            self.stop_reason = Some(reason.to_string());
        }
        for idx in 0..self.graph.len() {
            self.graph.task_mut(idx).stop_requested = true;
        }
    }

    /// Move doomed tasks forward: pending ones die, running ones are
    /// killed once their dependents are gone.
    fn advance_stops(&mut self, now: u64, fx: &mut Vec<Effect>) {
        let order: Vec<usize> = self.graph.logical().topological_order().iter().rev().copied().collect();
        for idx in order {
            let t = self.graph.task(idx);
            if !t.stop_requested || t.state.is_terminal() {
                continue;
            }
            match t.state {
                TaskState::Pending => {
                    let task = t.id.clone();
                    let grant = self.graph.task_mut(idx).grant.take();
                    fx.push(Effect::WithdrawPending(task));
                    if let Some(grant) = grant {
                        fx.push(Effect::ReleaseGrant(grant));
                    }
                    self.transition(idx, TaskState::Dead, Some("stopped before start".into()), now, fx);
                }
                TaskState::Starting | TaskState::Started | TaskState::Ready => {
                    let Some(execution_id) = t.execution_id.clone() else {
                        // Killed once the launch is acknowledged.
                        continue;
                    };
                    if !self.graph.dependents_done(idx) {
                        continue;
                    }
                    let task = t.id.clone();
                    if t.state == TaskState::Started {
                        fx.push(Effect::StopReadiness(task.clone()));
                    }
                    self.transition(idx, TaskState::Killing, self.stop_reason.clone(), now, fx);
                    fx.push(Effect::Kill { task, execution_id });
                }
                _ => {}
            }
        }
    }

    fn derive_state(&self) -> SessionState {
        let tasks = self.graph.tasks();
        let logical = self.graph.logical();
        // A required task that ended can never become READY again, so a
        // session that lost one stays stopping until it is stopped.
        let winding_down = self.stopping
            || tasks.iter().any(|t| {
                (t.stop_requested && !t.state.is_terminal())
                    || (logical.task(t.index).required && t.state.is_terminal())
            });
        if tasks.iter().all(|t| t.state.is_terminal()) {
            SessionState::Closed
        } else if winding_down {
            SessionState::Stopping
        } else if tasks
            .iter()
            .filter(|t| logical.task(t.index).required)
            .all(|t| t.state == TaskState::Ready)
        {
            SessionState::Running
        } else {
            SessionState::Building
        }
    }

    fn finish(&mut self, now: u64, mut fx: Vec<Effect>) -> Vec<Effect> {
        if self
            .graph
            .tasks()
            .iter()
            .any(|t| t.stop_requested && !t.state.is_terminal())
        {
            self.advance_stops(now, &mut fx);
        }

        let next = self.derive_state();
        if next != self.state {
            info!(session = %self.id, from = %self.state, to = %next, "session state changed");
            let reason = (next == SessionState::Stopping).then(|| self.stop_reason.clone()).flatten();
            fx.push(Effect::Telemetry(TransitionEvent {
                session: self.id.clone(),
                at: now,
                transition: Transition::Session {
                    from: self.state,
                    to: next,
                },
                reason,
            }));
            self.state = next;
        }
        fx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flowgrid_core::{LogicalTask, Offer, ReadinessDescriptor, ResourceRequest, ResourceSet, Scalars};

    use super::*;

    fn graph(tasks: Vec<LogicalTask>) -> Arc<LogicalGraph> {
        Arc::new(LogicalGraph::new("g", "1", tasks).unwrap())
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            max_launch_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            failure: FailurePolicy::AbortSession,
        }
    }

    fn session(tasks: Vec<LogicalTask>) -> Session {
        let mut s = Session::new("s1", "capture", 1, graph(tasks), policy(), 0);
        s.start(0);
        s
    }

    fn grant(node: &str) -> Grant {
        let node_resources = flowgrid_core::NodeResources::from_offers(
            node,
            [Offer::new(
                format!("{node}-offer"),
                node,
                ResourceSet {
                    scalars: Scalars::new(1000, 0, 0),
                    ..Default::default()
                },
            )],
        );
        node_resources
            .subtract(&ResourceRequest::new().with_cores(100))
            .unwrap()
            .grant
    }

    fn running(task: &str, exec: &str) -> ExecutionStatus {
        ExecutionStatus::new(exec, TaskRef::new("s1", task), ExecutionState::Running)
    }

    fn status(task: &str, exec: &str, state: ExecutionState) -> ExecutionStatus {
        ExecutionStatus::new(exec, TaskRef::new("s1", task), state)
    }

    fn launches(fx: &[Effect]) -> Vec<String> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Launch(req) => Some(req.task.task.clone()),
                _ => None,
            })
            .collect()
    }

    fn kills(fx: &[Effect]) -> Vec<String> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::Kill { task, .. } => Some(task.task.clone()),
                _ => None,
            })
            .collect()
    }

    /// Assign, accept, and report Running for an immediately-ready task.
    fn bring_up(s: &mut Session, task: &str, now: u64) -> Vec<Effect> {
        let mut fx = s.on_assignment(task, grant("n1"), now);
        fx.extend(s.on_launch_accepted(task, format!("exec-{task}"), now));
        fx.extend(s.on_status(&running(task, &format!("exec-{task}")), now));
        fx
    }

    #[test]
    fn start_publishes_every_task() {
        let mut s = Session::new(
            "s1",
            "capture",
            7,
            graph(vec![LogicalTask::new("a"), LogicalTask::new("b").depends_on("a")]),
            policy(),
            0,
        );
        let fx = s.start(0);
        let published: Vec<(String, bool, u64)> = fx
            .iter()
            .filter_map(|e| match e {
                Effect::PublishPending(p) => Some((p.task.task.clone(), p.dependency_ready, p.session_seq)),
                _ => None,
            })
            .collect();
        assert_eq!(
            published,
            vec![("a".to_string(), true, 7), ("b".to_string(), false, 7)]
        );
        assert_eq!(s.state(), SessionState::Building);
    }

    #[test]
    fn dependent_waits_for_predecessor_ready() {
        let mut s = session(vec![
            LogicalTask::new("a").with_readiness(ReadinessDescriptor::Tcp { port_index: 0 }),
            LogicalTask::new("b").depends_on("a"),
        ]);

        let fx = s.on_assignment("a", grant("n1"), 1);
        assert_eq!(launches(&fx), vec!["a"]);
        assert_eq!(s.task_state("a"), Some(TaskState::Starting));

        // B gets resources early but must not launch.
        let fx = s.on_assignment("b", grant("n1"), 2);
        assert!(launches(&fx).is_empty());
        assert_eq!(s.task_state("b"), Some(TaskState::Pending));

        s.on_launch_accepted("a", "exec-a".into(), 3);
        let fx = s.on_status(&running("a", "exec-a"), 4);
        assert!(fx.iter().any(|e| matches!(e, Effect::WatchReadiness(h) if h.task.task == "a")));
        assert_eq!(s.task_state("a"), Some(TaskState::Started));
        assert_eq!(s.task_state("b"), Some(TaskState::Pending));

        let fx = s.on_readiness("a", &ReadinessOutcome::Ready, 5);
        assert_eq!(s.task_state("a"), Some(TaskState::Ready));
        assert_eq!(launches(&fx), vec!["b"]);
        assert_eq!(s.task_state("b"), Some(TaskState::Starting));
    }

    #[test]
    fn ready_dependency_republishes_waiting_dependent() {
        let mut s = session(vec![LogicalTask::new("a"), LogicalTask::new("b").depends_on("a")]);
        let fx = bring_up(&mut s, "a", 1);
        let republished = fx.iter().any(|e| {
            matches!(e, Effect::PublishPending(p) if p.task.task == "b" && p.dependency_ready)
        });
        assert!(republished);
    }

    #[test]
    fn immediate_readiness_passes_through_started() {
        let mut s = session(vec![LogicalTask::new("a")]);
        let fx = bring_up(&mut s, "a", 1);
        let path: Vec<TaskState> = fx
            .iter()
            .filter_map(|e| match e {
                Effect::Telemetry(TransitionEvent {
                    transition: Transition::Task { to, .. },
                    ..
                }) => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(path, vec![TaskState::Starting, TaskState::Started, TaskState::Ready]);
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn early_readiness_is_buffered() {
        let mut s = session(vec![LogicalTask::new("a").with_readiness(ReadinessDescriptor::Tcp { port_index: 0 })]);
        s.on_assignment("a", grant("n1"), 1);
        s.on_launch_accepted("a", "exec-a".into(), 2);

        s.on_readiness("a", &ReadinessOutcome::Ready, 3);
        assert_eq!(s.task_state("a"), Some(TaskState::Starting));

        let fx = s.on_status(&running("a", "exec-a"), 4);
        assert_eq!(s.task_state("a"), Some(TaskState::Ready));
        assert!(!fx.iter().any(|e| matches!(e, Effect::WatchReadiness(_))));
    }

    #[test]
    fn status_before_launch_ack_adopts_execution() {
        let mut s = session(vec![LogicalTask::new("a")]);
        s.on_assignment("a", grant("n1"), 1);
        s.on_status(&running("a", "exec-a"), 2);
        assert_eq!(s.task_state("a"), Some(TaskState::Ready));

        let fx = s.on_launch_accepted("a", "exec-a".into(), 3);
        assert!(kills(&fx).is_empty());
    }

    #[test]
    fn replayed_status_is_idempotent() {
        let mut s = session(vec![LogicalTask::new("a")]);
        bring_up(&mut s, "a", 1);
        let before = s.status();

        let fx = s.on_status(&running("a", "exec-a"), 2);
        assert!(fx.is_empty());
        assert_eq!(s.status(), before);
    }

    #[test]
    fn stale_execution_status_is_discarded() {
        let mut s = session(vec![LogicalTask::new("a")]);
        bring_up(&mut s, "a", 1);

        let fx = s.on_status(&status("a", "exec-old", ExecutionState::Failed), 2);
        assert!(fx.is_empty());
        assert_eq!(s.task_state("a"), Some(TaskState::Ready));
    }

    #[test]
    fn launch_rejections_back_off_then_fail() {
        let mut s = session(vec![LogicalTask::new("e")]);

        for attempt in 1..=2u32 {
            s.on_assignment("e", grant("n1"), 1_000);
            let fx = s.on_launch_rejected("e", "agent refused", 1_000);
            assert!(fx.iter().any(|e| matches!(e, Effect::ReleaseGrant(_))));
            assert_eq!(s.task_state("e"), Some(TaskState::Pending));
            let task = s.task("e").unwrap();
            assert_eq!(task.attempts, attempt);
            assert_eq!(task.not_before, 1_000 + 100 * 2u64.pow(attempt - 1));
            assert!(fx.iter().any(|e| matches!(e, Effect::PublishPending(p) if p.not_before == task.not_before)));
        }

        s.on_assignment("e", grant("n1"), 2_000);
        s.on_launch_rejected("e", "agent refused", 2_000);
        assert_eq!(s.task_state("e"), Some(TaskState::Failed));
        let failure = s.task("e").unwrap().failure.clone().unwrap();
        assert_eq!(failure.kind, FailureKind::LaunchRejected);
    }

    #[test]
    fn async_launch_error_counts_as_rejection() {
        let mut s = session(vec![LogicalTask::new("e")]);
        s.on_assignment("e", grant("n1"), 1);
        s.on_launch_accepted("e", "exec-1".into(), 1);
        let fx = s.on_status(&status("e", "exec-1", ExecutionState::Error), 2);

        assert_eq!(s.task_state("e"), Some(TaskState::Pending));
        assert_eq!(s.task("e").unwrap().attempts, 1);
        assert!(!fx.iter().any(|e| matches!(e, Effect::ReleaseGrant(_))));
    }

    #[test]
    fn unexpected_termination_fails_and_aborts_session() {
        let mut s = session(vec![
            LogicalTask::new("a"),
            LogicalTask::new("b").depends_on("a"),
            LogicalTask::new("c"),
        ]);
        bring_up(&mut s, "a", 1);
        bring_up(&mut s, "b", 1);
        bring_up(&mut s, "c", 1);
        assert_eq!(s.state(), SessionState::Running);

        let fx = s.on_status(&status("a", "exec-a", ExecutionState::Failed), 2);

        assert_eq!(s.task_state("a"), Some(TaskState::Failed));
        assert_eq!(s.state(), SessionState::Stopping);
        let mut killed = kills(&fx);
        killed.sort();
        assert_eq!(killed, vec!["b", "c"]);
        assert_eq!(s.status().failures.len(), 1);
    }

    #[test]
    fn abort_subtree_spares_unrelated_tasks() {
        let mut s = Session::new(
            "s1",
            "capture",
            1,
            graph(vec![
                LogicalTask::new("a"),
                LogicalTask::new("b").depends_on("a"),
                LogicalTask::new("c"),
            ]),
            policy().with_failure(FailurePolicy::AbortSubtree),
            0,
        );
        s.start(0);
        bring_up(&mut s, "a", 1);
        bring_up(&mut s, "b", 1);
        bring_up(&mut s, "c", 1);

        let fx = s.on_status(&status("a", "exec-a", ExecutionState::Lost), 2);

        assert_eq!(kills(&fx), vec!["b"]);
        assert_eq!(s.task_state("c"), Some(TaskState::Ready));
        assert_eq!(s.state(), SessionState::Stopping);

        s.on_status(&status("b", "exec-b", ExecutionState::Killed), 3);
        assert_eq!(s.task_state("b"), Some(TaskState::Dead));
        assert_eq!(
            s.task("b").unwrap().failure.as_ref().map(|f| f.kind),
            Some(FailureKind::DependencyFailed)
        );

        // The subtree is gone but `c` keeps running until an operator stop.
        assert_eq!(s.state(), SessionState::Stopping);
        assert_eq!(s.task_state("c"), Some(TaskState::Ready));
        let session_status = s.status();
        let failed: Vec<&str> = session_status.failures.iter().map(|f| f.task.as_str()).collect();
        assert_eq!(failed, vec!["a", "b"]);

        let fx = s.stop("operator request", 4);
        assert_eq!(kills(&fx), vec!["c"]);
        s.on_status(&status("c", "exec-c", ExecutionState::Killed), 5);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn failed_optional_task_leaves_session_running() {
        let mut s = Session::new(
            "s1",
            "capture",
            1,
            graph(vec![LogicalTask::new("a"), LogicalTask::new("monitor").optional()]),
            policy().with_failure(FailurePolicy::AbortSubtree),
            0,
        );
        s.start(0);
        bring_up(&mut s, "a", 1);
        bring_up(&mut s, "monitor", 1);
        assert_eq!(s.state(), SessionState::Running);

        s.on_status(&status("monitor", "exec-monitor", ExecutionState::Failed), 2);
        assert_eq!(s.task_state("monitor"), Some(TaskState::Failed));
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn lost_grant_returns_task_to_pending_without_spending_an_attempt() {
        let mut s = Session::new(
            "s1",
            "capture",
            1,
            graph(vec![LogicalTask::new("a"), LogicalTask::new("b").depends_on("a")]),
            SessionPolicy {
                max_launch_attempts: 1,
                ..policy()
            },
            0,
        );
        s.start(0);
        assert!(launches(&s.on_assignment("b", grant("n1"), 1)).is_empty());
        let fx = bring_up(&mut s, "a", 2);
        assert_eq!(launches(&fx), vec!["a", "b"]);
        assert_eq!(s.task_state("b"), Some(TaskState::Starting));

        let fx = s.on_grant_lost("b", "offer n1-offer is no longer available", 3);
        assert!(fx.iter().any(|e| matches!(e, Effect::ReleaseGrant(g) if g.node == "n1")));
        assert!(fx.iter().any(|e| matches!(e, Effect::PublishPending(p) if p.task.task == "b" && p.dependency_ready)));
        let b = s.task("b").unwrap();
        assert_eq!(b.state, TaskState::Pending);
        assert_eq!(b.attempts, 0);
        assert!(b.grant.is_none() && b.node.is_none());
        assert!(b.failure.is_none());
        assert_eq!(s.state(), SessionState::Building);

        // A fresh grant launches it normally.
        let fx = s.on_assignment("b", grant("n2"), 4);
        assert_eq!(launches(&fx), vec!["b"]);
    }

    #[test]
    fn grant_loss_after_launch_ack_is_ignored() {
        let mut s = session(vec![LogicalTask::new("a")]);
        s.on_assignment("a", grant("n1"), 1);
        s.on_launch_accepted("a", "exec-a".into(), 1);
        assert!(s.on_grant_lost("a", "gone", 2).is_empty());
        assert_eq!(s.task_state("a"), Some(TaskState::Starting));
    }

    #[test]
    fn stop_kills_in_reverse_dependency_order() {
        let mut s = session(vec![
            LogicalTask::new("a"),
            LogicalTask::new("b").depends_on("a"),
            LogicalTask::new("c").depends_on("b"),
            LogicalTask::new("d"),
        ]);
        bring_up(&mut s, "a", 1);
        bring_up(&mut s, "b", 1);
        bring_up(&mut s, "c", 1);

        let fx = s.stop("operator request", 2);
        assert_eq!(kills(&fx), vec!["c"]);
        assert_eq!(s.task_state("d"), Some(TaskState::Dead));
        assert_eq!(s.task_state("a"), Some(TaskState::Ready));
        assert_eq!(s.state(), SessionState::Stopping);

        let fx = s.on_status(&status("c", "exec-c", ExecutionState::Killed), 3);
        assert_eq!(kills(&fx), vec!["b"]);
        let fx = s.on_status(&status("b", "exec-b", ExecutionState::Killed), 4);
        assert_eq!(kills(&fx), vec!["a"]);
        s.on_status(&status("a", "exec-a", ExecutionState::Killed), 5);

        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.graph().tasks().iter().all(|t| t.state == TaskState::Dead));
    }

    #[test]
    fn stop_releases_held_grants() {
        let mut s = session(vec![LogicalTask::new("a"), LogicalTask::new("b").depends_on("a")]);
        s.on_assignment("b", grant("n1"), 1);

        let fx = s.stop("operator request", 2);

        assert!(fx.iter().any(|e| matches!(e, Effect::ReleaseGrant(g) if g.node == "n1")));
        assert!(fx.iter().any(|e| matches!(e, Effect::WithdrawPending(t) if t.task == "a")));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn stop_during_launch_kills_after_ack() {
        let mut s = session(vec![LogicalTask::new("a")]);
        s.on_assignment("a", grant("n1"), 1);

        let fx = s.stop("operator request", 2);
        assert!(kills(&fx).is_empty());
        assert_eq!(s.task_state("a"), Some(TaskState::Starting));

        let fx = s.on_launch_accepted("a", "exec-a".into(), 3);
        assert_eq!(kills(&fx), vec!["a"]);
        assert_eq!(s.task_state("a"), Some(TaskState::Killing));
    }

    #[test]
    fn force_stop_ignores_ordering() {
        let mut s = session(vec![LogicalTask::new("a"), LogicalTask::new("b").depends_on("a")]);
        bring_up(&mut s, "a", 1);
        bring_up(&mut s, "b", 1);

        let mut killed = kills(&s.force_stop(2));
        killed.sort();
        assert_eq!(killed, vec!["a", "b"]);
    }

    #[test]
    fn reconciled_termination_skips_killing() {
        let mut s = session(vec![LogicalTask::new("f").with_readiness(ReadinessDescriptor::Tcp { port_index: 0 })]);
        s.on_assignment("f", grant("n1"), 1);
        s.on_launch_accepted("f", "exec-f".into(), 1);
        s.on_status(&running("f", "exec-f"), 1);
        assert_eq!(s.task_state("f"), Some(TaskState::Started));

        let fx = s.reconcile_terminated("f", "cluster reports execution gone", 2);

        assert_eq!(s.task_state("f"), Some(TaskState::Failed));
        assert!(kills(&fx).is_empty());
        assert!(fx.iter().any(|e| matches!(e, Effect::StopReadiness(_))));
    }

    #[test]
    fn readiness_errors_never_fail_the_task() {
        let mut s = session(vec![LogicalTask::new("a").with_readiness(ReadinessDescriptor::Tcp { port_index: 0 })]);
        s.on_assignment("a", grant("n1"), 1);
        s.on_launch_accepted("a", "exec-a".into(), 1);
        s.on_status(&running("a", "exec-a"), 1);

        for _ in 0..5 {
            s.on_readiness("a", &ReadinessOutcome::Error("connection reset".into()), 2);
        }
        let task = s.task("a").unwrap();
        assert_eq!(task.state, TaskState::Started);
        assert_eq!(task.readiness.errors, 5);
        assert_eq!(task.readiness.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn optional_tasks_do_not_gate_running() {
        let mut s = session(vec![LogicalTask::new("a"), LogicalTask::new("extra").optional()]);
        bring_up(&mut s, "a", 1);
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn stale_assignment_is_released() {
        let mut s = session(vec![LogicalTask::new("a")]);
        bring_up(&mut s, "a", 1);
        let fx = s.on_assignment("a", grant("n2"), 2);
        assert!(matches!(fx.as_slice(), [Effect::ReleaseGrant(g)] if g.node == "n2"));
    }
}

//! Task, execution and session states.

use std::fmt;

use flowgrid_core::{ExecutionId, TaskRef};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a physical task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for dependencies, resources, or a backoff to elapse.
    Pending,
    /// Launch issued, waiting for the cluster to report the process running.
    Starting,
    /// Process running; readiness is being checked.
    Started,
    /// Readiness check passed; dependents may start.
    Ready,
    /// Kill issued, waiting for the cluster to confirm.
    Killing,
    /// Terminated on request, or never started.
    Dead,
    /// Died unexpectedly or could not be launched.
    Failed,
}

impl TaskState {
    /// Whether the task will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Dead | TaskState::Failed)
    }

    /// Whether the task may have a process on the cluster.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            TaskState::Starting | TaskState::Started | TaskState::Ready | TaskState::Killing
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Starting => "starting",
            TaskState::Started => "started",
            TaskState::Ready => "ready",
            TaskState::Killing => "killing",
            TaskState::Dead => "dead",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Session-level state, derived from the states of its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Some required task is not READY yet.
    Building,
    /// Every required task is READY.
    Running,
    /// A session-wide stop was requested.
    Stopping,
    /// Every task is DEAD or FAILED.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Building => "building",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Execution state as reported by the cluster framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Staging,
    Starting,
    Running,
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
    /// The launch itself was invalid.
    Error,
    /// The launch was dropped before it reached the node.
    Dropped,
    Gone,
    /// The framework has no record of the execution.
    Unknown,
}

impl ExecutionState {
    /// The execution has ended, one way or another.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Finished
                | ExecutionState::Failed
                | ExecutionState::Killed
                | ExecutionState::Lost
                | ExecutionState::Error
                | ExecutionState::Dropped
                | ExecutionState::Gone
                | ExecutionState::Unknown
        )
    }

    /// The launch never produced a process.
    pub fn is_launch_failure(self) -> bool {
        matches!(self, ExecutionState::Error | ExecutionState::Dropped)
    }
}

/// One status update from the cluster framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub task: TaskRef,
    pub state: ExecutionState,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ExecutionStatus {
    pub fn new(execution_id: impl Into<ExecutionId>, task: TaskRef, state: ExecutionState) -> Self {
        Self {
            execution_id: execution_id.into(),
            task,
            state,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Why a task failed, or why a request could not be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No conceivable offer could satisfy the request.
    InfeasibleRequest,
    /// No current offer fits. Never escalated.
    TransientUnsatisfiable,
    /// The cluster refused the launch more often than allowed.
    LaunchRejected,
    /// The process died without a kill request.
    UnexpectedTermination,
    /// The framework connection was lost.
    ProtocolDisconnect,
    /// Stopped because a task it depends on failed.
    DependencyFailed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InfeasibleRequest => "infeasible request",
            FailureKind::TransientUnsatisfiable => "transiently unsatisfiable",
            FailureKind::LaunchRejected => "launch rejected",
            FailureKind::UnexpectedTermination => "unexpected termination",
            FailureKind::ProtocolDisconnect => "protocol disconnect",
            FailureKind::DependencyFailed => "dependency failed",
        };
        f.write_str(s)
    }
}

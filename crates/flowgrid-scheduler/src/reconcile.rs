//! Reconciliation planning after a framework reconnect.
//!
//! Compares what sessions believe is live against what the cluster reports
//! and decides, per task, how the session must correct itself. Planning is
//! pure; the driver delivers the actions and kills the orphans.

use std::collections::{BTreeMap, HashMap, HashSet};

use flowgrid_core::{ExecutionId, SessionId, TaskId, TaskRef};
use flowgrid_lifecycle::{ExecutionState, ExecutionStatus, LiveTask, TaskState};

/// Correction delivered to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The reported status belongs to the task's known execution.
    Apply(ExecutionStatus),
    /// The task was launched but never learned its execution id.
    Adopt {
        task: TaskId,
        execution_id: ExecutionId,
        state: ExecutionState,
    },
    /// The cluster no longer knows the task's execution.
    Missing { task: TaskId, reason: String },
    /// The launch went out but nothing came back.
    LaunchLost { task: TaskId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: BTreeMap<SessionId, Vec<ReconcileAction>>,
    /// Running executions no session owns.
    pub orphans: Vec<(TaskRef, ExecutionId)>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.orphans.is_empty()
    }

    fn push(&mut self, session: &str, action: ReconcileAction) {
        self.actions.entry(session.to_string()).or_default().push(action);
    }
}

/// Plan corrections for `live` tasks given the cluster's `reports`.
///
/// Tasks whose launch is still queued in the driver are left alone.
pub fn plan(live: &[LiveTask], reports: &[ExecutionStatus], queued_launches: &HashSet<TaskRef>) -> ReconcilePlan {
    let by_task: HashMap<&TaskRef, &LiveTask> = live.iter().map(|t| (&t.task, t)).collect();
    let mut matched: HashSet<&TaskRef> = HashSet::new();
    let mut plan = ReconcilePlan::default();

    for report in reports {
        let owner = by_task.get(&report.task).copied();
        match owner {
            Some(task) if task.execution_id.as_ref() == Some(&report.execution_id) => {
                matched.insert(&task.task);
                plan.push(&task.task.session, ReconcileAction::Apply(report.clone()));
            }
            Some(task)
                if task.execution_id.is_none()
                    && task.state == TaskState::Starting
                    && !matched.contains(&task.task) =>
            {
                matched.insert(&task.task);
                plan.push(
                    &task.task.session,
                    ReconcileAction::Adopt {
                        task: task.task.task.clone(),
                        execution_id: report.execution_id.clone(),
                        state: report.state,
                    },
                );
            }
            _ if !report.state.is_terminal() => {
                plan.orphans.push((report.task.clone(), report.execution_id.clone()));
            }
            _ => {}
        }
    }

    for task in live {
        if matched.contains(&task.task) || queued_launches.contains(&task.task) {
            continue;
        }
        let action = match &task.execution_id {
            Some(id) => ReconcileAction::Missing {
                task: task.task.task.clone(),
                reason: format!("execution {id} unknown to the cluster after reconnect"),
            },
            None => ReconcileAction::LaunchLost {
                task: task.task.task.clone(),
            },
        };
        plan.push(&task.task.session, action);
    }
    plan
}

//! Identifiers shared across flowgrid crates.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a cluster node (agent).
pub type NodeId = String;

/// Identifier of a resource offer, assigned by the cluster framework.
pub type OfferId = String;

/// Identifier of a launched process, assigned by the cluster framework.
pub type ExecutionId = String;

/// Identifier of a task, unique within its logical graph.
pub type TaskId = String;

/// Identifier of a session (one physical graph instance).
pub type SessionId = String;

/// Globally unique reference to a physical task: session plus task id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub session: SessionId,
    pub task: TaskId,
}

impl TaskRef {
    pub fn new(session: impl Into<SessionId>, task: impl Into<TaskId>) -> Self {
        Self {
            session: session.into(),
            task: task.into(),
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.task)
    }
}

/// Current Unix epoch in milliseconds.
///
/// All scheduler timestamps (offer expiry, retry deadlines) use this unit.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ref_display() {
        let r = TaskRef::new("sess-1", "ingest");
        assert_eq!(r.to_string(), "sess-1/ingest");
    }

    #[test]
    fn task_ref_orders_by_session_then_task() {
        let a = TaskRef::new("a", "z");
        let b = TaskRef::new("b", "a");
        assert!(a < b);
    }

    #[test]
    fn epoch_millis_is_recent() {
        // After 2024-01-01.
        assert!(epoch_millis() > 1_704_067_200_000);
    }
}

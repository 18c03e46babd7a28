//! Scheduler error types.

use std::path::PathBuf;
use std::time::Duration;

use flowgrid_core::{CoreError, InfeasibleRequest, TaskId};
use thiserror::Error;

/// Errors returned by the session manager and catalogs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("graph not found: {0}")]
    GraphNotFound(String),

    #[error("session name already in use: {0}")]
    NameTaken(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is not closed: {0}")]
    NotClosed(String),

    #[error("session build failed: {}", describe_infeasible(.0))]
    BuildFailed(Vec<(TaskId, InfeasibleRequest)>),

    #[error("session {session} did not close within {waited:?}")]
    StopTimedOut { session: String, waited: Duration },

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("catalog error in {path}: {reason}")]
    Catalog { path: PathBuf, reason: String },

    #[error("invalid cluster file {path}: {reason}")]
    ClusterConfig { path: PathBuf, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors reported by a [`ClusterFramework`](crate::framework::ClusterFramework).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    /// The framework refused the launch synchronously.
    #[error("launch rejected: {0}")]
    Rejected(String),

    #[error("framework disconnected")]
    Disconnected,

    #[error("framework error: {0}")]
    Failed(String),
}

fn describe_infeasible(tasks: &[(TaskId, InfeasibleRequest)]) -> String {
    tasks
        .iter()
        .map(|(task, reason)| format!("{task}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

//! Error types for flowgrid-core.

use thiserror::Error;

use crate::types::TaskId;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Umbrella error for callers that touch several core layers at once.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("task {task}: {source}")]
    Infeasible {
        task: TaskId,
        #[source]
        source: InfeasibleRequest,
    },
}

/// A request that no conceivable offer could ever satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfeasibleRequest {
    #[error("requested {requested} ports, a node has at most 65536")]
    TooManyPorts { requested: u32 },

    #[error("interface requirement names an empty network")]
    EmptyNetwork,

    #[error("two interface requirements for network {network}")]
    DuplicateNetwork { network: String },

    #[error("accelerator requirement names an empty class")]
    EmptyAcceleratorClass,

    #[error("zero accelerators of class {class} requested")]
    ZeroAccelerators { class: String },

    #[error("placement role is empty")]
    EmptyRole,
}

/// Structural problems in a logical graph, detected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("graph {0} has no tasks")]
    EmptyGraph(String),

    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("task {task} depends on unknown task {missing}")]
    UnknownDependency { task: TaskId, missing: TaskId },

    #[error("task {task} is co-located with unknown task {missing}")]
    UnknownColocation { task: TaskId, missing: TaskId },

    #[error("task {task} is anti-co-located with unknown task {missing}")]
    UnknownAntiColocation { task: TaskId, missing: TaskId },

    #[error("task {0} depends on itself")]
    SelfDependency(TaskId),

    #[error("tasks {a} and {b} are both co-located and anti-co-located")]
    ConflictingPlacement { a: TaskId, b: TaskId },

    #[error("dependency cycle through tasks: {}", tasks.join(", "))]
    Cycle { tasks: Vec<TaskId> },
}

/// Problems loading or resolving `flowgrid.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

//! flowgrid task lifecycle — task state machine and session controller.
//!
//! A session instantiates one logical graph as a physical graph and drives
//! each of its tasks through PENDING → STARTING → STARTED → READY, and on
//! stop through KILLING → DEAD. Tasks that die or cannot be launched end
//! FAILED, and the session's failure policy decides what else stops.
//!
//! Everything here is synchronous and side-effect free: callers feed
//! inputs into a [`Session`] and carry out the returned [`Effect`]s.
//!
//! # Components
//!
//! - **`state`** — Task, session and execution states, failure kinds
//! - **`physical`** — `PhysicalGraph` and `PhysicalTask`
//! - **`policy`** — Launch retry backoff and failure policy
//! - **`session`** — `Session` controller and its effects
//! - **`telemetry`** — Transition events and the `TelemetrySink` seam

pub mod physical;
pub mod policy;
pub mod session;
pub mod state;
pub mod telemetry;

pub use physical::{FailureRecord, PhysicalGraph, PhysicalTask, ReadinessInfo};
pub use policy::{RejectionDecision, SessionPolicy};
pub use session::{Effect, FailureSummary, LaunchRequest, LiveTask, Session, SessionStatus, TaskStatus};
pub use state::{ExecutionState, ExecutionStatus, FailureKind, SessionState, TaskState};
pub use telemetry::{MemorySink, NullSink, TelemetrySink, Transition, TransitionEvent};

//! flowgrid-state — durable telemetry for flowgrid sessions.
//!
//! Backed by [redb](https://docs.rs/redb). Every task and session
//! transition is appended to a per-session history, and the latest session
//! summary is kept alongside it, so a session can be audited after it has
//! closed and been forgotten by the scheduler.
//!
//! # Components
//!
//! - **`store`** — `StateStore`, on-disk or in-memory
//! - **`recorder`** — `TelemetryRecorder`, the non-blocking `TelemetrySink`
//! - **`types`** — `TransitionRecord`, `SessionRecord`

pub mod error;
pub mod recorder;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use recorder::TelemetryRecorder;
pub use store::StateStore;
pub use types::{SessionRecord, TransitionRecord};

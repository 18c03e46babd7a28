//! flowgrid scheduler — the runtime that turns sessions into executions.
//!
//! One driver task owns the offer pool and is the only caller of the
//! cluster framework. Each session runs as its own actor; actors publish
//! placement needs to the shared pending queue and receive assignments,
//! launch outcomes and status updates in their mailbox.
//!
//! # Components
//!
//! - **`framework`** — `ClusterFramework` trait and `FrameworkEvent`s
//! - **`driver`** — offer handling, allocation passes, decline/revive, reconciliation
//! - **`session_actor`** — per-session mailbox loop around the lifecycle controller
//! - **`pending`** — the pending queue shared by sessions and the driver
//! - **`reconcile`** — reconciliation planning after a reconnect
//! - **`catalog`** — graph catalogs (in memory, directory of JSON files)
//! - **`manager`** — `SessionManager`, the product-facing API
//! - **`sim`** — `SimCluster`, an in-memory cluster for tests and simulation

pub mod catalog;
pub mod driver;
pub mod error;
pub mod framework;
pub mod manager;
pub mod pending;
pub mod reconcile;
pub mod session_actor;
pub mod sim;

pub use catalog::{DirectoryCatalog, GraphCatalog, GraphRef, MemoryCatalog};
pub use driver::{Driver, DriverHandle, DriverSnapshot};
pub use error::{FrameworkError, SchedulerError, SchedulerResult};
pub use framework::{ClusterFramework, FrameworkEvent, LaunchRequest};
pub use manager::{ManagerParts, SessionManager, SessionSummary};
pub use pending::PendingQueue;
pub use reconcile::{ReconcileAction, ReconcilePlan};
pub use session_actor::SessionInput;
pub use sim::{SimCluster, SimClusterConfig, SimExecution, SimNode};

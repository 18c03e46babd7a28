//! flowgrid-core — shared types for the flowgrid scheduler.
//!
//! Everything in here is pure data plus validation and matching
//! predicates. No I/O other than reading config files, no async.
//!
//! # Components
//!
//! - **`types`** — identifiers shared across crates
//! - **`resources`** — offers, requests, grants, and the matching functions
//! - **`graph`** — logical graphs: validation, topological order, co-location classes
//! - **`descriptor`** — opaque launch payloads and readiness probe descriptors
//! - **`config`** — `flowgrid.toml` parsing and resolved scheduler settings

pub mod config;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod resources;
pub mod types;

pub use config::{parse_duration, FailurePolicy, FlowgridConfig, SchedulerSettings};
pub use descriptor::{LaunchDescriptor, ReadinessDescriptor};
pub use error::{ConfigError, CoreError, CoreResult, GraphError, InfeasibleRequest};
pub use graph::{GraphDefinition, LogicalGraph, LogicalTask};
pub use resources::{
    AcceleratorRequest, AcceleratorResource, Grant, Infeasible, InterfaceRequest,
    InterfaceResource, NodeResources, Offer, OfferFragment, PortRange, ResourceRequest,
    ResourceSet, Scalars, Subtraction, ANY_ROLE,
};
pub use types::*;

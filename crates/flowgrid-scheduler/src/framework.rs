//! The cluster framework seam.
//!
//! flowgrid never talks to nodes itself. A [`ClusterFramework`] (Mesos-like)
//! offers resources, launches and kills executions, and reports their status
//! asynchronously through a channel of [`FrameworkEvent`]s.

use async_trait::async_trait;
use flowgrid_core::{ExecutionId, Offer, OfferId};
use flowgrid_lifecycle::ExecutionStatus;

pub use flowgrid_lifecycle::LaunchRequest;

use crate::error::FrameworkError;

/// Asynchronous input from the cluster framework.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameworkEvent {
    Offers(Vec<Offer>),
    OfferRescinded(OfferId),
    Status(ExecutionStatus),
    Disconnected,
    Reconnected,
}

/// Commands the driver issues to the cluster. Only the driver calls these.
#[async_trait]
pub trait ClusterFramework: Send + Sync {
    /// Launch on the grant's offers. Returns the execution id on acceptance.
    async fn launch(&self, request: LaunchRequest) -> Result<ExecutionId, FrameworkError>;

    async fn kill(&self, execution_id: &ExecutionId) -> Result<(), FrameworkError>;

    /// Hand offers back to the cluster.
    async fn decline(&self, offers: &[OfferId]) -> Result<(), FrameworkError>;

    /// Ask for offers again after declining, for one role.
    async fn revive_offers(&self, role: &str) -> Result<(), FrameworkError>;

    /// Status of the given executions, plus every other execution the
    /// cluster runs for this framework.
    async fn reconcile(&self, executions: &[ExecutionId]) -> Result<Vec<ExecutionStatus>, FrameworkError>;
}

//! SimCluster — an in-memory cluster framework.
//!
//! Nodes advertise their free resources as offers; launches consume offer
//! fragments and report `Running` at once (unless held); kills and
//! terminations give resources back. Test hooks inject launch rejections,
//! silent terminations and disconnects. Used by the integration tests and
//! by `flowgridd simulate`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use flowgrid_core::{
    ANY_ROLE, ExecutionId, Grant, NodeId, Offer, OfferId, PortRange, ResourceSet, TaskId, TaskRef,
};
use flowgrid_lifecycle::{ExecutionState, ExecutionStatus, LaunchRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{FrameworkError, SchedulerError, SchedulerResult};
use crate::framework::{ClusterFramework, FrameworkEvent};

fn default_role() -> String {
    ANY_ROLE.to_string()
}

/// One simulated node and its total capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimNode {
    pub id: NodeId,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(flatten)]
    pub resources: ResourceSet,
}

impl SimNode {
    pub fn new(id: impl Into<NodeId>, resources: ResourceSet) -> Self {
        Self {
            id: id.into(),
            role: default_role(),
            resources,
        }
    }
}

/// `cluster.toml`: the simulated nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClusterConfig {
    #[serde(default)]
    pub nodes: Vec<SimNode>,
}

impl SimClusterConfig {
    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SchedulerError::ClusterConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// A simulated execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SimExecution {
    pub execution_id: ExecutionId,
    pub task: TaskRef,
    pub node: NodeId,
    pub state: ExecutionState,
    grant: Grant,
}

struct OutstandingOffer {
    node: NodeId,
    role: String,
    remaining: ResourceSet,
}

struct SimState {
    nodes: BTreeMap<NodeId, SimNode>,
    /// Resources neither offered nor used, per node.
    free: BTreeMap<NodeId, ResourceSet>,
    offers: BTreeMap<OfferId, OutstandingOffer>,
    executions: BTreeMap<ExecutionId, SimExecution>,
    rejections: HashMap<TaskId, u32>,
    held: BTreeSet<TaskId>,
    connected: bool,
    next_offer: u64,
    next_execution: u64,
    launches: u64,
}

impl SimState {
    fn release_to_node(&mut self, node: &str, resources: &ResourceSet) {
        if let Some(free) = self.free.get_mut(node) {
            free.merge(resources);
        }
    }

    fn finish(&mut self, execution_id: &str, state: ExecutionState) -> Option<SimExecution> {
        let exec = self.executions.get_mut(execution_id)?;
        if exec.state.is_terminal() {
            return None;
        }
        exec.state = state;
        let exec = exec.clone();
        for fragment in &exec.grant.fragments {
            self.release_to_node(&exec.node, &fragment.resources);
        }
        Some(exec)
    }
}

pub struct SimCluster {
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<FrameworkEvent>,
}

impl SimCluster {
    /// Create a cluster and the event stream the driver consumes.
    pub fn new(nodes: Vec<SimNode>) -> (Self, mpsc::UnboundedReceiver<FrameworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let free = nodes.iter().map(|n| (n.id.clone(), n.resources.clone())).collect();
        let nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let state = SimState {
            nodes,
            free,
            offers: BTreeMap::new(),
            executions: BTreeMap::new(),
            rejections: HashMap::new(),
            held: BTreeSet::new(),
            connected: true,
            next_offer: 0,
            next_execution: 0,
            launches: 0,
        };
        (
            Self {
                state: Mutex::new(state),
                events,
            },
            rx,
        )
    }

    pub fn from_config(config: SimClusterConfig) -> (Self, mpsc::UnboundedReceiver<FrameworkEvent>) {
        Self::new(config.nodes)
    }

    fn emit(&self, event: FrameworkEvent) {
        if self.events.send(event).is_err() {
            debug!("driver gone, dropping simulated event");
        }
    }

    /// Offer the free resources of every node, one offer per node.
    pub async fn offer_all(&self) -> Vec<OfferId> {
        let mut state = self.state.lock().await;
        let node_ids: Vec<NodeId> = state.nodes.keys().cloned().collect();
        let mut offers = Vec::new();
        for node in node_ids {
            if let Some(offer) = Self::make_offer(&mut state, &node) {
                offers.push(offer);
            }
        }
        drop(state);
        let ids = offers.iter().map(|o| o.id.clone()).collect();
        if !offers.is_empty() {
            self.emit(FrameworkEvent::Offers(offers));
        }
        ids
    }

    /// Offer the free resources of one node.
    pub async fn offer_node(&self, node: &str) -> Option<OfferId> {
        let offer = {
            let mut state = self.state.lock().await;
            Self::make_offer(&mut state, node)?
        };
        let id = offer.id.clone();
        self.emit(FrameworkEvent::Offers(vec![offer]));
        Some(id)
    }

    fn make_offer(state: &mut SimState, node: &str) -> Option<Offer> {
        let role = state.nodes.get(node)?.role.clone();
        let free = state.free.get_mut(node)?;
        if free.is_empty() {
            return None;
        }
        let resources = std::mem::take(free);
        state.next_offer += 1;
        let id = format!("offer-{:04}", state.next_offer);
        state.offers.insert(
            id.clone(),
            OutstandingOffer {
                node: node.to_string(),
                role: role.clone(),
                remaining: resources.clone(),
            },
        );
        Some(Offer::new(id, node, resources).with_role(role))
    }

    /// Withdraw an outstanding offer, as a cluster would under pressure.
    pub async fn rescind(&self, offer: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            match state.offers.remove(offer) {
                Some(o) => {
                    state.release_to_node(&o.node, &o.remaining);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.emit(FrameworkEvent::OfferRescinded(offer.to_string()));
        }
        removed
    }

    /// Reject the next `count` launches of tasks with this id.
    pub async fn reject_launches(&self, task: impl Into<TaskId>, count: u32) {
        self.state.lock().await.rejections.insert(task.into(), count);
    }

    /// Launches of tasks with this id stay in `Staging` until released.
    pub async fn hold(&self, task: impl Into<TaskId>) {
        self.state.lock().await.held.insert(task.into());
    }

    /// Let a held task run; reports `Running` for its live executions.
    pub async fn release_hold(&self, task: &str) {
        let started: Vec<ExecutionStatus> = {
            let mut state = self.state.lock().await;
            state.held.remove(task);
            state
                .executions
                .values_mut()
                .filter(|e| e.task.task == task && e.state == ExecutionState::Staging)
                .map(|e| {
                    e.state = ExecutionState::Running;
                    ExecutionStatus::new(e.execution_id.clone(), e.task.clone(), ExecutionState::Running)
                })
                .collect()
        };
        for status in started {
            self.emit(FrameworkEvent::Status(status));
        }
    }

    /// End a task's live execution. With `notify` the driver hears about
    /// it; without, only reconciliation will.
    pub async fn terminate(&self, task: &TaskRef, state: ExecutionState, notify: bool) -> Option<ExecutionId> {
        let exec = {
            let mut sim = self.state.lock().await;
            let id = sim
                .executions
                .values()
                .find(|e| e.task == *task && !e.state.is_terminal())
                .map(|e| e.execution_id.clone())?;
            sim.finish(&id, state)?
        };
        if notify {
            self.emit(FrameworkEvent::Status(
                ExecutionStatus::new(exec.execution_id.clone(), exec.task.clone(), state)
                    .with_reason("terminated by simulation"),
            ));
        }
        Some(exec.execution_id)
    }

    pub async fn disconnect(&self) {
        self.state.lock().await.connected = false;
        self.emit(FrameworkEvent::Disconnected);
    }

    pub async fn reconnect(&self) {
        self.state.lock().await.connected = true;
        self.emit(FrameworkEvent::Reconnected);
    }

    pub async fn executions(&self) -> Vec<SimExecution> {
        self.state.lock().await.executions.values().cloned().collect()
    }

    /// Live executions of a task, oldest first.
    pub async fn live_executions(&self, task: &TaskRef) -> Vec<SimExecution> {
        self.state
            .lock()
            .await
            .executions
            .values()
            .filter(|e| e.task == *task && !e.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Launch attempts seen so far, accepted or not.
    pub async fn launch_count(&self) -> u64 {
        self.state.lock().await.launches
    }

    pub async fn outstanding_offers(&self) -> usize {
        self.state.lock().await.offers.len()
    }
}

#[async_trait]
impl ClusterFramework for SimCluster {
    async fn launch(&self, request: LaunchRequest) -> Result<ExecutionId, FrameworkError> {
        let (status, held) = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(FrameworkError::Disconnected);
            }
            state.launches += 1;

            if let Some(left) = state.rejections.get_mut(&request.task.task) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FrameworkError::Rejected(format!(
                        "node {} refused task {}",
                        request.node, request.task
                    )));
                }
            }
            for fragment in &request.grant.fragments {
                let valid = state.offers.get(&fragment.offer_id).is_some_and(|o| {
                    o.node == request.node && (o.role == fragment.role || fragment.role == ANY_ROLE)
                });
                if !valid {
                    return Err(FrameworkError::Rejected(format!(
                        "offer {} is not outstanding on {}",
                        fragment.offer_id, request.node
                    )));
                }
            }
            for fragment in &request.grant.fragments {
                if let Some(offer) = state.offers.get_mut(&fragment.offer_id) {
                    offer.remaining = subtract_set(&offer.remaining, &fragment.resources);
                }
            }

            state.next_execution += 1;
            let execution_id = format!("exec-{:04}", state.next_execution);
            let held = state.held.contains(&request.task.task);
            let exec_state = if held {
                ExecutionState::Staging
            } else {
                ExecutionState::Running
            };
            state.executions.insert(
                execution_id.clone(),
                SimExecution {
                    execution_id: execution_id.clone(),
                    task: request.task.clone(),
                    node: request.node.clone(),
                    state: exec_state,
                    grant: request.grant.clone(),
                },
            );
            (
                ExecutionStatus::new(execution_id, request.task.clone(), exec_state),
                held,
            )
        };
        debug!(task = %request.task, node = %request.node, execution_id = %status.execution_id, held, "simulated launch");
        let execution_id = status.execution_id.clone();
        self.emit(FrameworkEvent::Status(status));
        Ok(execution_id)
    }

    async fn kill(&self, execution_id: &ExecutionId) -> Result<(), FrameworkError> {
        let killed = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(FrameworkError::Disconnected);
            }
            state.finish(execution_id, ExecutionState::Killed)
        };
        if let Some(exec) = killed {
            self.emit(FrameworkEvent::Status(ExecutionStatus::new(
                exec.execution_id,
                exec.task,
                ExecutionState::Killed,
            )));
        }
        Ok(())
    }

    async fn decline(&self, offers: &[OfferId]) -> Result<(), FrameworkError> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(FrameworkError::Disconnected);
        }
        for id in offers {
            if let Some(offer) = state.offers.remove(id) {
                state.release_to_node(&offer.node, &offer.remaining);
            }
        }
        Ok(())
    }

    async fn revive_offers(&self, role: &str) -> Result<(), FrameworkError> {
        if !self.state.lock().await.connected {
            return Err(FrameworkError::Disconnected);
        }
        debug!(%role, "simulated revive");
        self.offer_all().await;
        Ok(())
    }

    async fn reconcile(&self, executions: &[ExecutionId]) -> Result<Vec<ExecutionStatus>, FrameworkError> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(FrameworkError::Disconnected);
        }
        let mut reports: Vec<ExecutionStatus> = executions
            .iter()
            .filter(|id| !state.executions.contains_key(*id))
            .map(|id| {
                let task = TaskRef::new("", "");
                ExecutionStatus::new(id.clone(), task, ExecutionState::Gone)
            })
            .collect();
        // Implicit reconciliation: everything the cluster knows of.
        reports.extend(state.executions.values().filter_map(|e| {
            (executions.contains(&e.execution_id) || !e.state.is_terminal())
                .then(|| ExecutionStatus::new(e.execution_id.clone(), e.task.clone(), e.state))
        }));
        Ok(reports)
    }
}

/// `base` minus what `used` took from it.
fn subtract_set(base: &ResourceSet, used: &ResourceSet) -> ResourceSet {
    let taken: BTreeSet<u16> = used.ports.iter().flat_map(PortRange::ports).collect();
    let left: Vec<u16> = base
        .ports
        .iter()
        .flat_map(PortRange::ports)
        .filter(|p| !taken.contains(p))
        .collect();
    let mut ports: Vec<PortRange> = Vec::new();
    for port in left {
        match ports.last_mut() {
            Some(range) if range.end.checked_add(1) == Some(port) => range.end = port,
            _ => ports.push(PortRange::single(port)),
        }
    }

    let interfaces = base
        .interfaces
        .iter()
        .map(|iface| {
            let mut iface = iface.clone();
            let consumed: u64 = used
                .interfaces
                .iter()
                .filter(|u| u.name == iface.name && u.network == iface.network)
                .map(|u| u.bandwidth_bps)
                .sum();
            iface.bandwidth_bps = iface.bandwidth_bps.saturating_sub(consumed);
            iface
        })
        .collect();

    let accelerators = base
        .accelerators
        .iter()
        .filter(|a| !used.accelerators.iter().any(|u| u.id == a.id))
        .cloned()
        .collect();

    ResourceSet {
        scalars: base.scalars.saturating_sub(&used.scalars),
        ports,
        interfaces,
        accelerators,
    }
}

//! Session manager — the product-facing API.
//!
//! Owns the driver task and one actor per session. Sessions never share
//! their physical graphs; they meet only in the driver's offer pool and the
//! shared pending queue. A session name stays taken until the closed
//! session is forgotten.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flowgrid_core::{SchedulerSettings, SessionId, epoch_millis};
use flowgrid_health::{MonitorSettings, ReadinessCheck};
use flowgrid_lifecycle::{Session, SessionPolicy, SessionState, SessionStatus, TelemetrySink};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::{GraphCatalog, GraphRef};
use crate::driver::{Driver, DriverHandle, DriverSnapshot};
use crate::error::{SchedulerError, SchedulerResult};
use crate::framework::{ClusterFramework, FrameworkEvent};
use crate::pending::PendingQueue;
use crate::session_actor::{ActorHandle, SessionActor, SessionInput};

/// One line of [`SessionManager::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub graph: String,
    pub version: String,
    pub state: SessionState,
    pub tasks: usize,
    pub failures: usize,
}

impl From<&SessionStatus> for SessionSummary {
    fn from(status: &SessionStatus) -> Self {
        Self {
            id: status.id.clone(),
            name: status.name.clone(),
            graph: status.graph.clone(),
            version: status.version.clone(),
            state: status.state,
            tasks: status.tasks.len(),
            failures: status.failures.len(),
        }
    }
}

/// Everything a manager needs besides the cluster itself.
pub struct ManagerParts {
    pub catalog: Arc<dyn GraphCatalog>,
    pub readiness: Arc<dyn ReadinessCheck>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub settings: SchedulerSettings,
}

#[derive(Default)]
struct Registry {
    sessions: BTreeMap<SessionId, ActorHandle>,
    next_seq: u64,
    shut_down: bool,
}

pub struct SessionManager {
    catalog: Arc<dyn GraphCatalog>,
    readiness: Arc<dyn ReadinessCheck>,
    telemetry: Arc<dyn TelemetrySink>,
    settings: SchedulerSettings,
    pending: Arc<Mutex<PendingQueue>>,
    driver: DriverHandle,
    registry: Mutex<Registry>,
    shutdown: watch::Sender<bool>,
    driver_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Spawn the driver on `framework` and return a manager ready for sessions.
    pub fn start(
        framework: Arc<dyn ClusterFramework>,
        events: mpsc::UnboundedReceiver<FrameworkEvent>,
        parts: ManagerParts,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingQueue::new()));
        let (driver, handle, commands) = Driver::new(framework, parts.settings.clone(), pending.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let driver_task = tokio::spawn(driver.run(events, commands, shutdown_rx));
        info!(graphs = parts.catalog.list().len(), "session manager started");

        Self {
            catalog: parts.catalog,
            readiness: parts.readiness,
            telemetry: parts.telemetry,
            settings: parts.settings,
            pending,
            driver: handle,
            registry: Mutex::new(Registry::default()),
            shutdown,
            driver_task: Mutex::new(Some(driver_task)),
        }
    }

    /// Number new sessions after `seq`, so ids do not collide with
    /// sessions recorded by an earlier run.
    pub fn resume_after(mut self, seq: u64) -> Self {
        let registry = self.registry.get_mut();
        registry.next_seq = registry.next_seq.max(seq);
        self
    }

    /// Build and start a session of `graph` under a unique `name`.
    pub async fn create_session(&self, graph: &GraphRef, name: &str) -> SchedulerResult<SessionId> {
        let logical = self
            .catalog
            .get(graph)
            .ok_or_else(|| SchedulerError::GraphNotFound(graph.to_string()))?;

        let mut registry = self.registry.lock().await;
        if registry.shut_down {
            return Err(SchedulerError::ShutDown);
        }
        if registry.sessions.values().any(|h| h.status.borrow().name == name) {
            return Err(SchedulerError::NameTaken(name.to_string()));
        }
        let infeasible = logical.validate_requests();
        if !infeasible.is_empty() {
            warn!(graph = %graph, session = %name, tasks = infeasible.len(), "session build failed");
            return Err(SchedulerError::BuildFailed(infeasible));
        }

        registry.next_seq += 1;
        let seq = registry.next_seq;
        let id = format!("sess-{seq:04}");
        let session = Session::new(
            id.clone(),
            name,
            seq,
            logical,
            SessionPolicy::from(&self.settings),
            epoch_millis(),
        );
        let handle = SessionActor::spawn(
            session,
            self.pending.clone(),
            self.driver.clone(),
            self.readiness.clone(),
            MonitorSettings::from(&self.settings),
            self.telemetry.clone(),
        );
        registry.sessions.insert(id.clone(), handle);
        info!(session = %id, name = %name, graph = %graph, "session created");
        Ok(id)
    }

    /// Stop a session and wait until it is closed.
    ///
    /// Dependents are killed before their dependencies. If the session has
    /// not closed after `stop_timeout`, every live execution is killed
    /// directly and the wait starts over once.
    pub async fn stop_session(&self, id: &str) -> SchedulerResult<SessionStatus> {
        let (mailbox, status) = self.handle(id).await?;
        let timeout = self.settings.stop_timeout;

        let _ = mailbox.send(SessionInput::Stop {
            reason: "stop requested".into(),
        });
        if let Some(closed) = wait_for(status.clone(), is_closed, timeout).await {
            info!(session = %id, "session stopped");
            return Ok(closed);
        }

        warn!(session = %id, ?timeout, "cooperative stop timed out, forcing");
        let _ = mailbox.send(SessionInput::ForceStop);
        match wait_for(status, is_closed, timeout).await {
            Some(closed) => Ok(closed),
            None => Err(SchedulerError::StopTimedOut {
                session: id.to_string(),
                waited: timeout * 2,
            }),
        }
    }

    pub async fn get_session_status(&self, id: &str) -> SchedulerResult<SessionStatus> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .get(id)
            .map(|h| h.status.borrow().clone())
            .ok_or_else(|| SchedulerError::SessionNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .values()
            .map(|h| SessionSummary::from(&*h.status.borrow()))
            .collect()
    }

    /// Drop a closed session and free its name.
    pub async fn forget_session(&self, id: &str) -> SchedulerResult<SessionStatus> {
        let mut registry = self.registry.lock().await;
        let handle = registry
            .sessions
            .get(id)
            .ok_or_else(|| SchedulerError::SessionNotFound(id.to_string()))?;
        let status = handle.status.borrow().clone();
        if status.state != SessionState::Closed {
            return Err(SchedulerError::NotClosed(id.to_string()));
        }
        if let Some(handle) = registry.sessions.remove(id) {
            handle.task.abort();
        }
        info!(session = %id, name = %status.name, "session forgotten");
        Ok(status)
    }

    /// Wait until the session's status satisfies `predicate`.
    ///
    /// Returns the matching status, or `None` if `timeout` passes first.
    pub async fn wait_until<F>(&self, id: &str, predicate: F, timeout: Duration) -> SchedulerResult<Option<SessionStatus>>
    where
        F: Fn(&SessionStatus) -> bool,
    {
        let (_, status) = self.handle(id).await?;
        Ok(wait_for(status, predicate, timeout).await)
    }

    /// Driver counters, for diagnostics.
    pub async fn driver_snapshot(&self) -> Option<DriverSnapshot> {
        self.driver.inspect().await
    }

    /// Stop every session, then the driver.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = {
            let mut registry = self.registry.lock().await;
            registry.shut_down = true;
            registry.sessions.keys().cloned().collect()
        };
        for id in &ids {
            if let Err(e) = self.stop_session(id).await {
                warn!(session = %id, error = %e, "session did not stop cleanly");
            }
        }

        let _ = self.shutdown.send(true);
        if let Some(task) = self.driver_task.lock().await.take() {
            let _ = task.await;
        }
        info!(sessions = ids.len(), "session manager shut down");
    }

    async fn handle(&self, id: &str) -> SchedulerResult<(mpsc::UnboundedSender<SessionInput>, watch::Receiver<SessionStatus>)> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .get(id)
            .map(|h| (h.mailbox.clone(), h.status.clone()))
            .ok_or_else(|| SchedulerError::SessionNotFound(id.to_string()))
    }
}

fn is_closed(status: &SessionStatus) -> bool {
    status.state == SessionState::Closed
}

async fn wait_for<F>(mut rx: watch::Receiver<SessionStatus>, predicate: F, timeout: Duration) -> Option<SessionStatus>
where
    F: Fn(&SessionStatus) -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        let reached = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        match reached {
            Ok(status) => Some(status),
            // The actor is gone; its last status is final.
            Err(_) => {
                let last = rx.borrow().clone();
                predicate(&last).then_some(last)
            }
        }
    })
    .await;
    waited.ok().flatten()
}

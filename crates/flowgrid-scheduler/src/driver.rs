//! Driver loop — the only component that talks to the cluster framework.
//!
//! The driver is a tokio actor selecting over three inputs: framework events
//! (offers, rescinds, status updates, connection changes), commands from
//! session actors, and a periodic tick. It owns the offer pool, runs the
//! allocator over the shared pending queue, routes status updates to the
//! owning session, and reconciles after a reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use flowgrid_core::{ExecutionId, Grant, SchedulerSettings, SessionId, TaskRef, epoch_millis};
use flowgrid_lifecycle::{ExecutionStatus, LaunchRequest};
use flowgrid_placement::{OfferPool, allocate};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::FrameworkError;
use crate::framework::{ClusterFramework, FrameworkEvent};
use crate::pending::PendingQueue;
use crate::reconcile::{self, ReconcilePlan};
use crate::session_actor::{Mailbox, SessionInput};

/// Commands from session actors and the manager.
#[derive(Debug)]
pub enum DriverCommand {
    Register { session: SessionId, mailbox: Mailbox },
    Launch(LaunchRequest),
    Kill { task: TaskRef, execution_id: ExecutionId },
    Release(Grant),
    /// The pending queue changed; run an allocation pass.
    Wake,
    SessionClosed(SessionId),
    /// Reply with a snapshot of the driver's bookkeeping.
    Inspect(oneshot::Sender<DriverSnapshot>),
}

/// Point-in-time view of the driver, for status output and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverSnapshot {
    pub connected: bool,
    pub sessions: usize,
    pub executions: usize,
    pub offers: usize,
    pub pending: usize,
    pub queued_commands: usize,
}

/// Cloneable sender side of the driver's command channel.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    tx: mpsc::UnboundedSender<DriverCommand>,
}

impl DriverHandle {
    fn send(&self, command: DriverCommand) {
        if self.tx.send(command).is_err() {
            debug!("driver stopped, dropping command");
        }
    }

    pub(crate) fn register(&self, session: SessionId, mailbox: Mailbox) {
        self.send(DriverCommand::Register { session, mailbox });
    }

    pub fn launch(&self, request: LaunchRequest) {
        self.send(DriverCommand::Launch(request));
    }

    pub fn kill(&self, task: TaskRef, execution_id: ExecutionId) {
        self.send(DriverCommand::Kill { task, execution_id });
    }

    pub fn release(&self, grant: Grant) {
        self.send(DriverCommand::Release(grant));
    }

    pub fn wake(&self) {
        self.send(DriverCommand::Wake);
    }

    pub fn session_closed(&self, session: SessionId) {
        self.send(DriverCommand::SessionClosed(session));
    }

    /// `None` once the driver has stopped.
    pub async fn inspect(&self) -> Option<DriverSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DriverCommand::Inspect(reply)).ok()?;
        rx.await.ok()
    }
}

/// A launch or kill waiting for the framework connection.
#[derive(Debug)]
enum Deferred {
    Launch(LaunchRequest),
    Kill { task: TaskRef, execution_id: ExecutionId },
}

pub struct Driver {
    framework: Arc<dyn ClusterFramework>,
    settings: SchedulerSettings,
    pool: OfferPool,
    pending: Arc<Mutex<PendingQueue>>,
    sessions: HashMap<SessionId, Mailbox>,
    /// Known executions and the task each one runs.
    executions: HashMap<ExecutionId, TaskRef>,
    connected: bool,
    deferred: Vec<Deferred>,
    last_revive: u64,
}

impl Driver {
    /// Create a driver and the handle sessions use to command it.
    pub fn new(
        framework: Arc<dyn ClusterFramework>,
        settings: SchedulerSettings,
        pending: Arc<Mutex<PendingQueue>>,
    ) -> (Self, DriverHandle, mpsc::UnboundedReceiver<DriverCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Self {
            framework,
            settings,
            pool: OfferPool::new(),
            pending,
            sessions: HashMap::new(),
            executions: HashMap::new(),
            connected: true,
            deferred: Vec::new(),
            last_revive: 0,
        };
        (driver, DriverHandle { tx }, rx)
    }

    /// Run until shutdown is signalled.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<FrameworkEvent>,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick = ?self.settings.tick, "driver started");

        loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_event(event).await,
                Some(command) = commands.recv() => self.on_command(command).await,
                _ = tick.tick() => self.on_tick().await,
                _ = shutdown.changed() => break,
            }
        }

        let unused = self.pool.take_unheld();
        if !unused.is_empty() && self.connected {
            if let Err(e) = self.framework.decline(&unused).await {
                warn!(count = unused.len(), error = %e, "decline on shutdown failed");
            }
        }
        info!(sessions = self.sessions.len(), "driver stopped");
    }

    // ── Framework events ──────────────────────────────────────────

    async fn on_event(&mut self, event: FrameworkEvent) {
        match event {
            FrameworkEvent::Offers(offers) => {
                debug!(count = offers.len(), "offers received");
                self.pool.add_batch(offers, epoch_millis());
                self.allocation_pass().await;
            }
            FrameworkEvent::OfferRescinded(id) => {
                if self.pool.rescind(&id).is_some() {
                    debug!(offer = %id, "offer rescinded");
                }
            }
            FrameworkEvent::Status(status) => self.route_status(status).await,
            FrameworkEvent::Disconnected => {
                warn!("framework disconnected, holding launches and kills");
                self.connected = false;
                // Unheld offers do not survive the connection.
                let dropped = self.pool.take_unheld();
                debug!(dropped = dropped.len(), "offers invalidated");
            }
            FrameworkEvent::Reconnected => {
                info!("framework reconnected, reconciling");
                self.connected = true;
                self.reconcile().await;
                self.replay_deferred().await;
                self.allocation_pass().await;
            }
        }
    }

    async fn route_status(&mut self, status: ExecutionStatus) {
        if status.state.is_terminal() {
            self.executions.remove(&status.execution_id);
        } else {
            self.executions
                .entry(status.execution_id.clone())
                .or_insert_with(|| status.task.clone());
        }

        match self.sessions.get(&status.task.session) {
            Some(mailbox) => {
                debug!(task = %status.task, execution_id = %status.execution_id, state = ?status.state, "routing status");
                if mailbox.send(SessionInput::Status(status)).is_err() {
                    debug!("session mailbox closed");
                }
            }
            None if !status.state.is_terminal() => {
                warn!(task = %status.task, execution_id = %status.execution_id, "status for unknown session, killing orphan");
                self.kill(status.task, status.execution_id).await;
            }
            None => {}
        }
    }

    // ── Commands ──────────────────────────────────────────────────

    async fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::Register { session, mailbox } => {
                debug!(%session, "session registered");
                self.sessions.insert(session, mailbox);
            }
            DriverCommand::Launch(request) => self.launch(request).await,
            DriverCommand::Kill { task, execution_id } => self.kill(task, execution_id).await,
            DriverCommand::Release(grant) => {
                let restored = self.pool.release(&grant);
                debug!(node = %grant.node, restored, "grant released");
                self.allocation_pass().await;
            }
            DriverCommand::Wake => self.allocation_pass().await,
            DriverCommand::SessionClosed(session) => {
                self.sessions.remove(&session);
                self.executions.retain(|_, task| task.session != session);
                let withdrawn = self.pending.lock().await.remove_session(&session);
                debug!(%session, withdrawn, "session deregistered");
            }
            DriverCommand::Inspect(reply) => {
                let snapshot = DriverSnapshot {
                    connected: self.connected,
                    sessions: self.sessions.len(),
                    executions: self.executions.len(),
                    offers: self.pool.offer_count(),
                    pending: self.pending.lock().await.len(),
                    queued_commands: self.deferred.len(),
                };
                let _ = reply.send(snapshot);
            }
        }
    }

    async fn launch(&mut self, request: LaunchRequest) {
        if !self.connected {
            debug!(task = %request.task, "disconnected, deferring launch");
            self.deferred.push(Deferred::Launch(request));
            return;
        }

        let task = request.task.clone();
        let grant = request.grant.clone();
        if let Some(gone) = grant.offer_ids().into_iter().find(|id| !self.pool.contains(id)) {
            warn!(%task, offer = %gone, "granted offer left the pool, returning task to pending");
            self.notify(&task, SessionInput::GrantLost {
                task: task.task.clone(),
                reason: format!("offer {gone} is no longer available"),
            });
            return;
        }
        match self.framework.launch(request.clone()).await {
            Ok(execution_id) => {
                self.pool.settle(&grant);
                self.executions.insert(execution_id.clone(), task.clone());
                info!(%task, node = %grant.node, %execution_id, "launch accepted");
                self.notify(&task, SessionInput::LaunchAccepted {
                    task: task.task.clone(),
                    execution_id,
                });
            }
            Err(FrameworkError::Disconnected) => {
                warn!(%task, "framework disconnected during launch, deferring");
                self.connected = false;
                self.deferred.push(Deferred::Launch(request));
            }
            Err(e) => {
                // The session releases the grant back to the pool.
                warn!(%task, error = %e, "launch rejected");
                let reason = match e {
                    FrameworkError::Rejected(reason) => reason,
                    other => other.to_string(),
                };
                self.notify(&task, SessionInput::LaunchRejected {
                    task: task.task.clone(),
                    reason,
                });
            }
        }
    }

    async fn kill(&mut self, task: TaskRef, execution_id: ExecutionId) {
        if !self.connected {
            debug!(%task, %execution_id, "disconnected, deferring kill");
            self.deferred.push(Deferred::Kill { task, execution_id });
            return;
        }
        match self.framework.kill(&execution_id).await {
            Ok(()) => debug!(%task, %execution_id, "kill issued"),
            Err(FrameworkError::Disconnected) => {
                warn!(%task, %execution_id, "framework disconnected during kill, deferring");
                self.connected = false;
                self.deferred.push(Deferred::Kill { task, execution_id });
            }
            Err(e) => error!(%task, %execution_id, error = %e, "kill failed"),
        }
    }

    fn notify(&self, task: &TaskRef, input: SessionInput) {
        match self.sessions.get(&task.session) {
            Some(mailbox) => {
                if mailbox.send(input).is_err() {
                    debug!(%task, "session mailbox closed");
                }
            }
            None => debug!(%task, "no session for task"),
        }
    }

    async fn replay_deferred(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            info!(count = deferred.len(), "replaying deferred commands");
        }
        for command in deferred {
            match command {
                Deferred::Launch(request) => self.launch(request).await,
                Deferred::Kill { task, execution_id } => self.kill(task, execution_id).await,
            }
        }
    }

    // ── Allocation ────────────────────────────────────────────────

    async fn allocation_pass(&mut self) {
        if !self.connected || self.pool.is_empty() {
            return;
        }
        let now = epoch_millis();
        let mut pending = self.pending.lock().await;
        let snapshot = pending.snapshot();
        if snapshot.is_empty() {
            return;
        }

        let outcome = allocate(&mut self.pool, &snapshot, now);
        if !outcome.unsatisfiable.is_empty() {
            debug!(count = outcome.unsatisfiable.len(), "tasks left pending without a fitting offer");
        }
        for assignment in outcome.assignments {
            pending.remove(&assignment.task);
            let delivered = match self.sessions.get(&assignment.task.session) {
                Some(mailbox) => mailbox
                    .send(SessionInput::Assignment {
                        task: assignment.task.task.clone(),
                        grant: assignment.grant.clone(),
                    })
                    .is_ok(),
                None => false,
            };
            if delivered {
                debug!(task = %assignment.task, node = %assignment.grant.node, "task assigned");
            } else {
                self.pool.release(&assignment.grant);
            }
        }
    }

    // ── Tick: expiry, decline, revive ─────────────────────────────

    async fn on_tick(&mut self) {
        let now = epoch_millis();
        let expired = self.pool.drop_expired(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "offers expired");
        }
        if !self.connected {
            return;
        }

        self.allocation_pass().await;

        let (pending_empty, oldest_waiting, roles) = {
            let pending = self.pending.lock().await;
            (pending.is_empty(), pending.oldest_waiting(now), pending.roles())
        };

        let declinable = if pending_empty {
            self.pool.take_unheld()
        } else {
            let window = self.settings.offer_decline_after.as_millis() as u64;
            self.pool.take_declinable(now, window)
        };
        if !declinable.is_empty() {
            debug!(count = declinable.len(), "declining offers");
            if let Err(e) = self.framework.decline(&declinable).await {
                warn!(error = %e, "decline failed");
            }
        }

        let revive = self.settings.revive_interval.as_millis() as u64;
        let starving = oldest_waiting.is_some_and(|since| since.saturating_add(revive) <= now);
        if starving && self.last_revive.saturating_add(revive) <= now {
            self.last_revive = now;
            for role in roles {
                info!(%role, "reviving offers for starving tasks");
                if let Err(e) = self.framework.revive_offers(&role).await {
                    warn!(%role, error = %e, "revive failed");
                }
            }
        }
    }

    // ── Reconciliation ────────────────────────────────────────────

    async fn reconcile(&mut self) {
        let mut live = Vec::new();
        for (session, mailbox) in &self.sessions {
            let (reply, rx) = oneshot::channel();
            if mailbox.send(SessionInput::LiveTasks(reply)).is_err() {
                continue;
            }
            match rx.await {
                Ok(tasks) => live.extend(tasks),
                Err(_) => debug!(%session, "session closed during reconciliation"),
            }
        }

        let known: Vec<ExecutionId> = live.iter().filter_map(|t| t.execution_id.clone()).collect();
        let reports = match self.framework.reconcile(&known).await {
            Ok(reports) => reports,
            Err(e) => {
                error!(error = %e, "reconciliation request failed");
                if e == FrameworkError::Disconnected {
                    self.connected = false;
                }
                return;
            }
        };

        let queued: HashSet<TaskRef> = self
            .deferred
            .iter()
            .filter_map(|d| match d {
                Deferred::Launch(request) => Some(request.task.clone()),
                Deferred::Kill { .. } => None,
            })
            .collect();
        let plan = reconcile::plan(&live, &reports, &queued);
        self.apply_reconciliation(plan, &reports).await;
    }

    async fn apply_reconciliation(&mut self, plan: ReconcilePlan, reports: &[ExecutionStatus]) {
        for report in reports {
            if report.state.is_terminal() {
                self.executions.remove(&report.execution_id);
            }
        }
        for (task, execution_id) in plan.orphans {
            warn!(%task, %execution_id, "reconciliation: killing orphaned execution");
            self.kill(task, execution_id).await;
        }
        for (session, actions) in plan.actions {
            if let Some(mailbox) = self.sessions.get(&session) {
                warn!(%session, corrections = actions.len(), "reconciliation: correcting session");
                let _ = mailbox.send(SessionInput::Reconcile(actions));
            }
        }
    }
}

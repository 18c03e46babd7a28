//! Session actor — the single writer of one session.
//!
//! Every input for a session (assignments, launch outcomes, cluster status,
//! readiness results, stop requests) goes through its mailbox. The actor
//! feeds it to the [`Session`] controller and carries out the effects:
//! pending-queue updates, driver commands, readiness watches and telemetry.
//! The latest [`SessionStatus`] is published on a watch channel.

use std::sync::Arc;

use flowgrid_core::{ExecutionId, Grant, TaskId, TaskRef, epoch_millis};
use flowgrid_health::{MonitorSettings, ReadinessCallback, ReadinessCheck, ReadinessMonitor, ReadinessOutcome};
use flowgrid_lifecycle::{
    Effect, ExecutionStatus, LiveTask, Session, SessionStatus, TelemetrySink, Transition,
};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::driver::DriverHandle;
use crate::pending::PendingQueue;
use crate::reconcile::ReconcileAction;

/// Mailbox input of a session actor.
#[derive(Debug)]
pub enum SessionInput {
    Assignment { task: TaskId, grant: Grant },
    LaunchAccepted { task: TaskId, execution_id: ExecutionId },
    LaunchRejected { task: TaskId, reason: String },
    /// An offer behind the task's grant was rescinded or expired before
    /// the launch went out.
    GrantLost { task: TaskId, reason: String },
    Status(ExecutionStatus),
    Readiness { task: TaskId, outcome: ReadinessOutcome },
    /// Reply with the tasks that may have a process on the cluster.
    LiveTasks(oneshot::Sender<Vec<LiveTask>>),
    Reconcile(Vec<ReconcileAction>),
    Stop { reason: String },
    ForceStop,
}

pub(crate) type Mailbox = mpsc::UnboundedSender<SessionInput>;

/// What the manager keeps of a spawned actor.
pub(crate) struct ActorHandle {
    pub mailbox: Mailbox,
    pub status: watch::Receiver<SessionStatus>,
    pub task: JoinHandle<()>,
}

pub(crate) struct SessionActor {
    session: Session,
    pending: Arc<Mutex<PendingQueue>>,
    driver: DriverHandle,
    monitor: ReadinessMonitor,
    telemetry: Arc<dyn TelemetrySink>,
    status: watch::Sender<SessionStatus>,
}

impl SessionActor {
    pub(crate) fn spawn(
        session: Session,
        pending: Arc<Mutex<PendingQueue>>,
        driver: DriverHandle,
        check: Arc<dyn ReadinessCheck>,
        monitor_settings: MonitorSettings,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> ActorHandle {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(session.status());

        let readiness_mailbox = mailbox.clone();
        let callback: ReadinessCallback = Arc::new(move |task: TaskRef, outcome: ReadinessOutcome| {
            let mailbox = readiness_mailbox.clone();
            Box::pin(async move {
                let _ = mailbox.send(SessionInput::Readiness {
                    task: task.task,
                    outcome,
                });
            })
        });
        let monitor = ReadinessMonitor::new(check, monitor_settings, callback);

        driver.register(session.id().to_string(), mailbox.clone());
        let actor = Self {
            session,
            pending,
            driver,
            monitor,
            telemetry,
            status,
        };
        let task = tokio::spawn(actor.run(inbox));
        ActorHandle {
            mailbox,
            status: status_rx,
            task,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        let effects = self.session.start(epoch_millis());
        self.apply(effects).await;

        while let Some(input) = inbox.recv().await {
            let now = epoch_millis();
            let effects = match input {
                SessionInput::Assignment { task, grant } => self.session.on_assignment(&task, grant, now),
                SessionInput::LaunchAccepted { task, execution_id } => {
                    self.session.on_launch_accepted(&task, execution_id, now)
                }
                SessionInput::LaunchRejected { task, reason } => self.session.on_launch_rejected(&task, &reason, now),
                SessionInput::GrantLost { task, reason } => self.session.on_grant_lost(&task, &reason, now),
                SessionInput::Status(status) => self.session.on_status(&status, now),
                SessionInput::Readiness { task, outcome } => self.session.on_readiness(&task, &outcome, now),
                SessionInput::LiveTasks(reply) => {
                    let _ = reply.send(self.session.live_tasks());
                    Vec::new()
                }
                SessionInput::Reconcile(actions) => self.reconcile(actions, now),
                SessionInput::Stop { reason } => self.session.stop(&reason, now),
                SessionInput::ForceStop => self.session.force_stop(now),
            };
            self.apply(effects).await;
            if self.session.is_closed() {
                break;
            }
        }

        self.monitor.stop_all().await;
        let withdrawn = self.pending.lock().await.remove_session(self.session.id());
        self.driver.session_closed(self.session.id().to_string());
        info!(session = %self.session.id(), withdrawn, "session actor stopped");
    }

    fn reconcile(&mut self, actions: Vec<ReconcileAction>, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        for action in actions {
            let step = match action {
                ReconcileAction::Apply(status) => self.session.on_status(&status, now),
                ReconcileAction::Adopt {
                    task,
                    execution_id,
                    state,
                } => self.session.reconcile_adopt(&task, execution_id, state, now),
                ReconcileAction::Missing { task, reason } => self.session.reconcile_terminated(&task, &reason, now),
                ReconcileAction::LaunchLost { task } => self.session.reconcile_launch_lost(&task, now),
            };
            effects.extend(step);
        }
        effects
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut wake = false;
        let mut session_changed = false;
        for effect in effects {
            match effect {
                Effect::PublishPending(task) => {
                    self.pending.lock().await.upsert(task, epoch_millis());
                    wake = true;
                }
                Effect::WithdrawPending(task) => {
                    self.pending.lock().await.remove(&task);
                }
                Effect::Launch(request) => self.driver.launch(request),
                Effect::Kill { task, execution_id } => self.driver.kill(task, execution_id),
                Effect::ReleaseGrant(grant) => self.driver.release(grant),
                Effect::WatchReadiness(handle) => self.monitor.start_watch(handle).await,
                Effect::StopReadiness(task) => self.monitor.stop_watch(&task).await,
                Effect::Telemetry(event) => {
                    session_changed |= matches!(event.transition, Transition::Session { .. });
                    self.telemetry.record(event);
                }
            }
        }
        if wake {
            self.driver.wake();
        }

        let status = self.session.status();
        if session_changed {
            debug!(session = %status.id, state = %status.state, "publishing session snapshot");
            self.telemetry.snapshot(&status);
        }
        self.status.send_replace(status);
    }
}

//! Readiness monitor — one background polling task per started task.
//!
//! Each watch polls its [`ReadinessCheck`] on the tracker's interval and
//! reports every outcome through the callback. The watch ends by itself
//! after the first `Ready`, or when it is stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flowgrid_core::{SchedulerSettings, TaskRef};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::checker::{ReadinessCheck, ReadinessOutcome, ReadinessTracker, TaskHandle};

/// Callback invoked with every readiness outcome of a watched task.
pub type ReadinessCallback = Arc<dyn Fn(TaskRef, ReadinessOutcome) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Polling intervals for readiness watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub max_interval: Duration,
}

impl From<&SchedulerSettings> for MonitorSettings {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            interval: settings.readiness_interval,
            max_interval: settings.readiness_max_interval,
        }
    }
}

struct WatchSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages readiness watches for all started tasks of one owner.
pub struct ReadinessMonitor {
    check: Arc<dyn ReadinessCheck>,
    settings: MonitorSettings,
    callback: ReadinessCallback,
    watches: Arc<RwLock<HashMap<TaskRef, WatchSlot>>>,
}

impl ReadinessMonitor {
    pub fn new(check: Arc<dyn ReadinessCheck>, settings: MonitorSettings, callback: ReadinessCallback) -> Self {
        Self {
            check,
            settings,
            callback,
            watches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start polling a task. Replaces any existing watch for the same task.
    pub async fn start_watch(&self, handle: TaskHandle) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = handle.task.clone();
        let check = self.check.clone();
        let callback = self.callback.clone();
        let settings = self.settings;

        let join = tokio::spawn(async move {
            run_readiness_loop(handle, check, settings, callback, shutdown_rx).await;
        });

        let mut watches = self.watches.write().await;
        if let Some(old) = watches.insert(
            task.clone(),
            WatchSlot {
                handle: join,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        debug!(%task, "readiness watch started");
    }

    pub async fn stop_watch(&self, task: &TaskRef) {
        let mut watches = self.watches.write().await;
        if let Some(slot) = watches.remove(task) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%task, "readiness watch stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut watches = self.watches.write().await;
        for (task, slot) in watches.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%task, "readiness watch stopped");
        }
    }

    /// Tasks with a watch that has not finished yet.
    pub async fn active_watches(&self) -> Vec<TaskRef> {
        let watches = self.watches.read().await;
        let mut tasks: Vec<TaskRef> = watches
            .iter()
            .filter(|(_, slot)| !slot.handle.is_finished())
            .map(|(task, _)| task.clone())
            .collect();
        tasks.sort();
        tasks
    }

    pub async fn is_watching(&self, task: &TaskRef) -> bool {
        let watches = self.watches.read().await;
        watches.get(task).is_some_and(|slot| !slot.handle.is_finished())
    }
}

async fn run_readiness_loop(
    handle: TaskHandle,
    check: Arc<dyn ReadinessCheck>,
    settings: MonitorSettings,
    callback: ReadinessCallback,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = ReadinessTracker::new(settings.interval, settings.max_interval);
    let task = handle.task.clone();

    // The first check runs right away; later ones wait for the tracker.
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let outcome = check.check(&handle).await;
                let ready = tracker.record(&outcome);
                callback(task.clone(), outcome).await;
                if ready {
                    debug!(%task, checks = tracker.checks(), "readiness loop finished");
                    break;
                }
                delay = tracker.next_interval();
            }
            _ = shutdown.changed() => {
                debug!(%task, "readiness loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use flowgrid_core::ReadinessDescriptor;
    use tokio::sync::mpsc;

    use super::*;

    /// Returns the scripted outcomes in order, then `NotReady` forever.
    struct Scripted(Mutex<Vec<ReadinessOutcome>>);

    #[async_trait]
    impl ReadinessCheck for Scripted {
        async fn check(&self, _handle: &TaskHandle) -> ReadinessOutcome {
            let mut script = self.0.lock().unwrap();
            if script.is_empty() {
                ReadinessOutcome::NotReady
            } else {
                script.remove(0)
            }
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
        }
    }

    fn handle(task: &str) -> TaskHandle {
        TaskHandle {
            task: TaskRef::new("s", task),
            node: "n1".into(),
            host: "127.0.0.1".into(),
            ports: vec![],
            execution_id: format!("exec-{task}"),
            descriptor: ReadinessDescriptor::External { handle: "x".into() },
        }
    }

    fn channel_callback() -> (ReadinessCallback, mpsc::UnboundedReceiver<(TaskRef, ReadinessOutcome)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: ReadinessCallback = Arc::new(move |task, outcome| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((task, outcome));
            })
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn reports_every_outcome_until_ready() {
        let check = Arc::new(Scripted(Mutex::new(vec![
            ReadinessOutcome::NotReady,
            ReadinessOutcome::Error("refused".into()),
            ReadinessOutcome::Ready,
        ])));
        let (callback, mut rx) = channel_callback();
        let monitor = ReadinessMonitor::new(check, settings(), callback);

        monitor.start_watch(handle("a")).await;

        let mut outcomes = Vec::new();
        while let Some((task, outcome)) = rx.recv().await {
            assert_eq!(task, TaskRef::new("s", "a"));
            let done = outcome == ReadinessOutcome::Ready;
            outcomes.push(outcome);
            if done {
                break;
            }
        }
        assert_eq!(outcomes.len(), 3);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_watching(&TaskRef::new("s", "a")).await);
    }

    #[tokio::test]
    async fn stop_watch_ends_polling() {
        let check = Arc::new(Scripted(Mutex::new(Vec::new())));
        let (callback, _rx) = channel_callback();
        let monitor = ReadinessMonitor::new(check, settings(), callback);

        monitor.start_watch(handle("a")).await;
        monitor.start_watch(handle("b")).await;
        assert_eq!(monitor.active_watches().await.len(), 2);

        monitor.stop_watch(&TaskRef::new("s", "a")).await;
        assert!(!monitor.is_watching(&TaskRef::new("s", "a")).await);
        assert!(monitor.is_watching(&TaskRef::new("s", "b")).await);

        monitor.stop_all().await;
        assert!(monitor.active_watches().await.is_empty());
    }
}

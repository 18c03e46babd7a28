//! TelemetryRecorder — a non-blocking `TelemetrySink` over the store.
//!
//! Sessions hand events over an unbounded channel; a blocking writer thread
//! drains it into redb. Write failures are logged and the event dropped:
//! telemetry never feeds back into scheduling.

use flowgrid_core::epoch_millis;
use flowgrid_lifecycle::{SessionStatus, TelemetrySink, Transition, TransitionEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::StateStore;
use crate::types::SessionRecord;

enum Message {
    Event(TransitionEvent),
    Snapshot(SessionRecord),
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the writer thread.
#[derive(Clone)]
pub struct TelemetryRecorder {
    tx: mpsc::UnboundedSender<Message>,
}

impl TelemetryRecorder {
    /// Start the writer. It runs until every recorder handle is dropped.
    pub fn spawn(store: StateStore) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some(message) = rx.blocking_recv() {
                match message {
                    Message::Event(event) => match store.append_transition(&event) {
                        Ok(_) => written += 1,
                        Err(e) => warn!(session = %event.session, error = %e, "failed to record transition"),
                    },
                    Message::Snapshot(record) => {
                        if let Err(e) = store.put_session(&record) {
                            warn!(session = %record.id, error = %e, "failed to record session snapshot");
                        }
                    }
                    Message::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(written, "telemetry writer stopped");
        });
        (Self { tx }, writer)
    }

    /// Wait until everything queued so far is written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Message::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl TelemetrySink for TelemetryRecorder {
    fn record(&self, event: TransitionEvent) {
        if let Transition::Session { to, .. } = &event.transition {
            debug!(session = %event.session, %to, "recording session transition");
        }
        if self.tx.send(Message::Event(event)).is_err() {
            warn!("telemetry writer gone, dropping transition");
        }
    }

    fn snapshot(&self, status: &SessionStatus) {
        let record = SessionRecord::from_status(status, epoch_millis());
        if self.tx.send(Message::Snapshot(record)).is_err() {
            warn!("telemetry writer gone, dropping session snapshot");
        }
    }
}

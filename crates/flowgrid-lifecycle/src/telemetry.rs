//! Transition events handed to the telemetry collaborator.
//!
//! Recording must never block the session that produced the event, so
//! [`TelemetrySink::record`] is synchronous and infallible; sinks that do
//! I/O queue the event and write it elsewhere.

use std::sync::Mutex;

use flowgrid_core::{SessionId, TaskId};
use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;
use crate::state::{SessionState, TaskState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Task {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
    Session {
        from: SessionState,
        to: SessionState,
    },
}

/// One state change, task- or session-level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub session: SessionId,
    /// Epoch milliseconds.
    pub at: u64,
    #[serde(flatten)]
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TransitionEvent);

    /// Full session snapshot, offered after every session-level change.
    fn snapshot(&self, _status: &SessionStatus) {}
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _event: TransitionEvent) {}
}

/// Keeps every event in memory, for tests and the simulator.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TransitionEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Task transitions for one task, in recording order.
    pub fn task_path(&self, session: &str, task: &str) -> Vec<TaskState> {
        let mut path = Vec::new();
        for event in self.events() {
            if let Transition::Task { task: t, from, to } = &event.transition {
                if event.session == session && t == task {
                    if path.is_empty() {
                        path.push(*from);
                    }
                    path.push(*to);
                }
            }
        }
        path
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, event: TransitionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event(task: &str, from: TaskState, to: TaskState) -> TransitionEvent {
        TransitionEvent {
            session: "s1".into(),
            at: 1,
            transition: Transition::Task {
                task: task.into(),
                from,
                to,
            },
            reason: None,
        }
    }

    #[test]
    fn memory_sink_reconstructs_path() {
        let sink = MemorySink::new();
        sink.record(task_event("a", TaskState::Pending, TaskState::Starting));
        sink.record(task_event("b", TaskState::Pending, TaskState::Dead));
        sink.record(task_event("a", TaskState::Starting, TaskState::Started));

        assert_eq!(
            sink.task_path("s1", "a"),
            vec![TaskState::Pending, TaskState::Starting, TaskState::Started]
        );
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn event_serializes_flat() {
        let json = serde_json::to_value(task_event("a", TaskState::Ready, TaskState::Killing)).unwrap();
        assert_eq!(json["kind"], "task");
        assert_eq!(json["from"], "ready");
        assert_eq!(json["to"], "killing");
        assert!(json.get("reason").is_none());
    }
}

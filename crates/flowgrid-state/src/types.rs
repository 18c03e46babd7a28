//! Persisted records.

use flowgrid_core::SessionId;
use flowgrid_lifecycle::{FailureSummary, SessionState, SessionStatus, TransitionEvent};
use serde::{Deserialize, Serialize};

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Position within the session's history, starting at 0.
    pub seq: u64,
    pub event: TransitionEvent,
}

impl TransitionRecord {
    pub fn table_key(&self) -> String {
        transition_key(&self.event.session, self.seq)
    }
}

pub(crate) fn transition_key(session: &str, seq: u64) -> String {
    format!("{session}:{seq:020}")
}

/// Latest known summary of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub graph: String,
    pub version: String,
    pub state: SessionState,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub failures: Vec<FailureSummary>,
}

impl SessionRecord {
    pub fn from_status(status: &SessionStatus, now: u64) -> Self {
        Self {
            id: status.id.clone(),
            name: status.name.clone(),
            graph: status.graph.clone(),
            version: status.version.clone(),
            state: status.state,
            created_at: status.created_at,
            updated_at: now,
            failures: status.failures.clone(),
        }
    }
}

//! Errors raised by the telemetry store.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// A failed store operation. Backend errors are carried as text so the
/// store does not leak redb's error types to its callers.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open telemetry store: {0}")]
    Open(String),

    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open table: {0}")]
    Table(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    /// A record could not be turned into its JSON column value.
    #[error("cannot encode record: {0}")]
    Encode(String),

    /// A stored column value is not a valid record.
    #[error("corrupt record: {0}")]
    Decode(String),
}

//! redb table definitions for the telemetry store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON). Transition keys
//! are `{session}:{seq:020}` so a prefix scan yields one session's history
//! in recording order.

use redb::TableDefinition;

/// Transition records keyed by `{session}:{seq:020}`.
pub const TRANSITIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transitions");

/// Latest session snapshot keyed by `{session}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Next transition sequence number per session.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

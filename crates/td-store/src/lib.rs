//! SQLite entity store for td.
//!
//! One database file (`.todos/issues.db`) holds every replicated table plus
//! the local `action_log` journal and the `sync_state` watermarks. Every
//! mutating operation writes the entity row and its action_log row in a
//! single transaction; the sync engine ships those rows as events.

mod action_log;
mod entities;
mod error;
mod issues;
pub mod query;
mod store;

pub use action_log::{ActionEntry, ActionType, SyncAck};
pub use error::StoreError;
pub use query::{DateRange, IssueFilter, PointsFilter};
pub use store::{Store, SyncState};

/// Tables that participate in replication. The apply path validates incoming
/// entity types against this set.
pub const REPLICATED_TABLES: &[&str] = &[
    "issues",
    "logs",
    "handoffs",
    "comments",
    "dependencies",
    "boards",
    "board_positions",
    "work_sessions",
    "git_snapshots",
    "issue_files",
];

/// Returns `true` when `entity_type` names a replicated table.
pub fn is_replicated_table(entity_type: &str) -> bool {
    REPLICATED_TABLES.contains(&entity_type)
}

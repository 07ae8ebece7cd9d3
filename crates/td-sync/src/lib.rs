//! The td synchronization engine.
//!
//! Clients journal every mutation locally (td-store's action_log), push
//! unsynced journal rows to a server event log that assigns globally-ordered
//! per-project sequence numbers, and pull other devices' events to converge.
//! Application is deterministic and ordered, so any two clients that have
//! applied the same prefix of the event log hold identical entity tables.

pub mod apply;
pub mod autosync;
pub mod client;
pub mod protocol;
pub mod server_log;
pub mod transport;

pub use apply::apply_remote_events;
pub use client::{SyncClient, SyncSummary};
pub use protocol::{Ack, ApplyFailure, ApplyResult, Event, PullResult, PushResult};
pub use server_log::EventLog;
pub use transport::{HttpTransport, LocalTransport, SyncTransport};

/// Errors produced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] td_store::StoreError),
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection: {0}")]
    Connection(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("sync disabled for project {0}")]
    Disabled(String),
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

pub(crate) fn from_call(e: tokio_rusqlite::Error) -> SyncError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => SyncError::Sqlite(e),
        tokio_rusqlite::Error::Other(boxed) => SyncError::Connection(boxed.to_string()),
        other => SyncError::Connection(other.to_string()),
    }
}

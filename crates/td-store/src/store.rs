use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;

use td_core::types::StatusCounts;
use td_core::DATA_DIR;

use crate::error::{from_call, StoreError};

/// Current schema version, stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Database file name under `.todos/`.
pub const DB_FILE: &str = "issues.db";

/// Async SQLite-backed entity store.
///
/// All access goes through one [`tokio_rusqlite::Connection`]; SQLite's
/// single-writer discipline serializes mutations. Every logged mutation runs
/// entity write and action_log write inside one `conn.transaction()`.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open an existing store under `<dir>/.todos/issues.db`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = dir.as_ref().join(DATA_DIR).join(DB_FILE);
        if !path.exists() {
            return Err(StoreError::NotFound {
                entity: "database",
                id: path.display().to_string(),
            });
        }
        let conn = Connection::open(&path).await.map_err(from_call)?;
        let store = Self { conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create `<dir>/.todos/` and initialize a fresh database (idempotent).
    pub async fn initialize(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = dir.as_ref().join(DATA_DIR);
        std::fs::create_dir_all(&data_dir)?;
        let conn = Connection::open(data_dir.join(DB_FILE)).await.map_err(from_call)?;
        let store = Self { conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// A purely in-memory store (tests, pull-all verification).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(from_call)?;
        let store = Self { conn };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying connection, for the sync engine's batch application.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the store, flushing WAL state.
    pub async fn close(self) -> Result<(), StoreError> {
        self.conn
            .close()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Schema & migrations
    // -----------------------------------------------------------------------

    /// Apply pending migrations, driven by `PRAGMA user_version`.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
                if version < 1 {
                    conn.execute_batch(BASE_SCHEMA)?;
                    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                    tracing::info!(version = SCHEMA_VERSION, "database schema initialized");
                }
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    // -----------------------------------------------------------------------
    // Status roll-up
    // -----------------------------------------------------------------------

    /// Per-status counts over non-deleted issues.
    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.conn
            .call(|conn| {
                let count = |status: &str| -> rusqlite::Result<u64> {
                    conn.query_row(
                        "SELECT COUNT(*) FROM issues WHERE status = ?1 AND deleted_at IS NULL",
                        rusqlite::params![status],
                        |r| r.get(0),
                    )
                };
                let total: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM issues WHERE deleted_at IS NULL",
                    [],
                    |r| r.get(0),
                )?;
                Ok(StatusCounts {
                    open: count("open")?,
                    in_progress: count("in_progress")?,
                    blocked: count("blocked")?,
                    in_review: count("in_review")?,
                    closed: count("closed")?,
                    total,
                })
            })
            .await
            .map_err(from_call)
    }

    // -----------------------------------------------------------------------
    // Sync state
    // -----------------------------------------------------------------------

    /// Read the per-project sync watermarks, defaulting to zeros.
    pub async fn sync_state(&self, project_id: &str) -> Result<SyncState, StoreError> {
        let project = project_id.to_string();
        self.conn
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let row = conn
                    .query_row(
                        "SELECT project_id, last_pushed_action_id, last_pulled_server_seq,
                                last_sync_at, sync_disabled
                         FROM sync_state WHERE project_id = ?1",
                        rusqlite::params![project],
                        |r| {
                            Ok(SyncState {
                                project_id: r.get(0)?,
                                last_pushed_action_id: r.get(1)?,
                                last_pulled_server_seq: r.get(2)?,
                                last_sync_at: r.get::<_, Option<String>>(3)?.map(|s| parse_ts(&s)),
                                sync_disabled: r.get::<_, i64>(4)? != 0,
                            })
                        },
                    )
                    .optional()?;
                Ok(row.unwrap_or_else(|| SyncState::new(&project)))
            })
            .await
            .map_err(from_call)
    }

    /// Upsert the sync watermarks.
    pub async fn save_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        let state = state.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO sync_state
                        (project_id, last_pushed_action_id, last_pulled_server_seq,
                         last_sync_at, sync_disabled)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        state.project_id,
                        state.last_pushed_action_id,
                        state.last_pulled_server_seq,
                        state.last_sync_at.map(|t| t.to_rfc3339()),
                        state.sync_disabled as i64,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// SyncState
// ---------------------------------------------------------------------------

/// Per-project sync watermarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub project_id: String,
    pub last_pushed_action_id: i64,
    pub last_pulled_server_seq: i64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_disabled: bool,
}

impl SyncState {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            last_pushed_action_id: 0,
            last_pulled_server_seq: 0,
            last_sync_at: None,
            sync_disabled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared row helpers
// ---------------------------------------------------------------------------

/// Parse an RFC3339 column value.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

const BASE_SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;
    PRAGMA temp_store=MEMORY;

    CREATE TABLE IF NOT EXISTS issues (
        id                  TEXT PRIMARY KEY,
        title               TEXT NOT NULL DEFAULT '',
        description         TEXT,
        status              TEXT NOT NULL DEFAULT 'open',
        issue_type          TEXT NOT NULL DEFAULT 'task',
        priority            TEXT NOT NULL DEFAULT 'p2',
        points              INTEGER NOT NULL DEFAULT 0,
        labels              TEXT NOT NULL DEFAULT '[]',
        parent_id           TEXT,
        acceptance          TEXT,
        creator_session     TEXT NOT NULL DEFAULT '',
        implementer_session TEXT,
        reviewer_session    TEXT,
        created_at          TEXT NOT NULL DEFAULT '',
        updated_at          TEXT NOT NULL DEFAULT '',
        closed_at           TEXT,
        deleted_at          TEXT,
        due_date            TEXT,
        defer_until         TEXT,
        defer_count         INTEGER NOT NULL DEFAULT 0,
        minor               INTEGER NOT NULL DEFAULT 0,
        created_branch      TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
    CREATE INDEX IF NOT EXISTS idx_issues_parent ON issues(parent_id);

    CREATE TABLE IF NOT EXISTS logs (
        id              TEXT PRIMARY KEY,
        issue_id        TEXT,
        session_id      TEXT NOT NULL DEFAULT '',
        work_session_id TEXT,
        message         TEXT NOT NULL DEFAULT '',
        log_type        TEXT NOT NULL DEFAULT 'progress',
        timestamp       TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_logs_issue ON logs(issue_id);

    CREATE TABLE IF NOT EXISTS handoffs (
        id         TEXT PRIMARY KEY,
        issue_id   TEXT NOT NULL DEFAULT '',
        session_id TEXT NOT NULL DEFAULT '',
        done       TEXT NOT NULL DEFAULT '[]',
        remaining  TEXT NOT NULL DEFAULT '[]',
        decisions  TEXT NOT NULL DEFAULT '[]',
        uncertain  TEXT NOT NULL DEFAULT '[]',
        timestamp  TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_handoffs_issue ON handoffs(issue_id);

    CREATE TABLE IF NOT EXISTS comments (
        id         TEXT PRIMARY KEY,
        issue_id   TEXT NOT NULL DEFAULT '',
        session_id TEXT NOT NULL DEFAULT '',
        text       TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT ''
    );

    CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id);

    CREATE TABLE IF NOT EXISTS dependencies (
        id         TEXT PRIMARY KEY,
        from_issue TEXT NOT NULL DEFAULT '',
        to_issue   TEXT NOT NULL DEFAULT '',
        kind       TEXT NOT NULL DEFAULT 'blocks',
        UNIQUE(from_issue, to_issue, kind)
    );

    CREATE TABLE IF NOT EXISTS boards (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL DEFAULT '',
        query      TEXT,
        created_at TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS board_positions (
        id       TEXT PRIMARY KEY,
        board_id TEXT NOT NULL DEFAULT '',
        issue_id TEXT NOT NULL DEFAULT '',
        position INTEGER NOT NULL DEFAULT 0,
        UNIQUE(board_id, issue_id)
    );

    CREATE TABLE IF NOT EXISTS work_sessions (
        id         TEXT PRIMARY KEY,
        name       TEXT NOT NULL DEFAULT '',
        session_id TEXT NOT NULL DEFAULT '',
        started_at TEXT NOT NULL DEFAULT '',
        ended_at   TEXT,
        start_sha  TEXT,
        end_sha    TEXT
    );

    CREATE TABLE IF NOT EXISTS git_snapshots (
        id          TEXT PRIMARY KEY,
        issue_id    TEXT NOT NULL DEFAULT '',
        event       TEXT NOT NULL DEFAULT 'start',
        commit_sha  TEXT NOT NULL DEFAULT '',
        branch      TEXT NOT NULL DEFAULT '',
        dirty_files INTEGER NOT NULL DEFAULT 0,
        timestamp   TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS issue_files (
        id        TEXT PRIMARY KEY,
        issue_id  TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        role      TEXT NOT NULL DEFAULT 'implementation',
        linked_at TEXT NOT NULL DEFAULT '',
        UNIQUE(issue_id, file_path)
    );

    CREATE TABLE IF NOT EXISTS action_log (
        rowid         INTEGER PRIMARY KEY AUTOINCREMENT,
        id            TEXT NOT NULL DEFAULT '',
        session_id    TEXT NOT NULL DEFAULT '',
        action_type   TEXT NOT NULL,
        entity_type   TEXT NOT NULL,
        entity_id     TEXT NOT NULL,
        previous_data TEXT,
        new_data      TEXT,
        timestamp     TEXT NOT NULL,
        undone        INTEGER NOT NULL DEFAULT 0,
        synced_at     TEXT,
        server_seq    INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_action_log_pending
        ON action_log(undone, synced_at);

    CREATE TABLE IF NOT EXISTS sync_state (
        project_id             TEXT PRIMARY KEY,
        last_pushed_action_id  INTEGER NOT NULL DEFAULT 0,
        last_pulled_server_seq INTEGER NOT NULL DEFAULT 0,
        last_sync_at           TEXT,
        sync_disabled          INTEGER NOT NULL DEFAULT 0
    );
";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_creates_db_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::initialize(dir.path()).await.unwrap();
        store.close().await.unwrap();
        assert!(dir.path().join(DATA_DIR).join(DB_FILE).exists());

        // Reopen goes through `open` and re-runs migrations harmlessly.
        let store = Store::open(dir.path()).await.unwrap();
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_missing_db_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Store::open(dir.path()).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn sync_state_defaults_then_persists() {
        let store = Store::open_in_memory().await.unwrap();

        let state = store.sync_state("proj").await.unwrap();
        assert_eq!(state.last_pushed_action_id, 0);
        assert_eq!(state.last_pulled_server_seq, 0);
        assert!(!state.sync_disabled);

        let mut state = state;
        state.last_pulled_server_seq = 42;
        state.last_sync_at = Some(Utc::now());
        store.save_sync_state(&state).await.unwrap();

        let reread = store.sync_state("proj").await.unwrap();
        assert_eq!(reread.last_pulled_server_seq, 42);
        assert!(reread.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn status_counts_empty() {
        let store = Store::open_in_memory().await.unwrap();
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.total, 0);
        assert_eq!(counts.open, 0);
    }
}

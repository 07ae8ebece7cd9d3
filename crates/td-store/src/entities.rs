//! CRUD for the non-issue entities. Every mutation follows the same
//! discipline as issues: entity write plus action_log row in one transaction.

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use td_core::types::{
    Board, BoardPosition, Comment, DepKind, Dependency, FileRole, GitEvent, GitSnapshot, Handoff,
    IssueFile, LogEntry, LogType, WorkSession, BOARD_POSITION_GAP,
};

use crate::action_log::{log_action_tx, ActionType};
use crate::error::{from_call, StoreError};
use crate::store::{parse_ts, parse_ts_opt, Store};

fn list_json(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".into())
}

fn list_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

fn log_record(log: &LogEntry) -> Value {
    serde_json::json!({
        "id": log.id,
        "issue_id": log.issue_id,
        "session_id": log.session_id,
        "work_session_id": log.work_session_id,
        "message": log.message,
        "log_type": log.log_type.as_str(),
        "timestamp": log.timestamp.to_rfc3339(),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let log_type: String = row.get(5)?;
    let ts: String = row.get(6)?;
    Ok(LogEntry {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        session_id: row.get(2)?,
        work_session_id: row.get(3)?,
        message: row.get(4)?,
        log_type: LogType::parse(&log_type).unwrap_or(LogType::Progress),
        timestamp: parse_ts(&ts),
    })
}

impl Store {
    pub async fn create_log_logged(
        &self,
        log: &LogEntry,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let log = log.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO logs (id, issue_id, session_id, work_session_id, message, log_type, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        log.id,
                        log.issue_id,
                        log.session_id,
                        log.work_session_id,
                        log.message,
                        log.log_type.as_str(),
                        log.timestamp.to_rfc3339(),
                    ],
                )?;
                log_action_tx(&tx, &session, ActionType::Create, "logs", &log.id, None, Some(&log_record(&log)))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Logs for one issue, or the standalone stream when `issue_id` is None.
    pub async fn list_logs(&self, issue_id: Option<&str>) -> Result<Vec<LogEntry>, StoreError> {
        let issue = issue_id.map(String::from);
        self.connection()
            .call(move |conn| {
                let (sql, param): (&str, Option<&String>) = match &issue {
                    Some(id) => (
                        "SELECT id, issue_id, session_id, work_session_id, message, log_type, timestamp
                         FROM logs WHERE issue_id = ?1 ORDER BY timestamp ASC",
                        Some(id),
                    ),
                    None => (
                        "SELECT id, issue_id, session_id, work_session_id, message, log_type, timestamp
                         FROM logs WHERE issue_id IS NULL ORDER BY timestamp ASC",
                        None,
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let mut out = Vec::new();
                let mut rows = match param {
                    Some(p) => stmt.query(rusqlite::params![p])?,
                    None => stmt.query([])?,
                };
                while let Some(row) = rows.next()? {
                    out.push(row_to_log(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Handoffs
// ---------------------------------------------------------------------------

fn handoff_record(h: &Handoff) -> Value {
    serde_json::json!({
        "id": h.id,
        "issue_id": h.issue_id,
        "session_id": h.session_id,
        "done": list_json(&h.done),
        "remaining": list_json(&h.remaining),
        "decisions": list_json(&h.decisions),
        "uncertain": list_json(&h.uncertain),
        "timestamp": h.timestamp.to_rfc3339(),
    })
}

fn row_to_handoff(row: &rusqlite::Row<'_>) -> rusqlite::Result<Handoff> {
    let done: String = row.get(3)?;
    let remaining: String = row.get(4)?;
    let decisions: String = row.get(5)?;
    let uncertain: String = row.get(6)?;
    let ts: String = row.get(7)?;
    Ok(Handoff {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        session_id: row.get(2)?,
        done: list_from_json(&done),
        remaining: list_from_json(&remaining),
        decisions: list_from_json(&decisions),
        uncertain: list_from_json(&uncertain),
        timestamp: parse_ts(&ts),
    })
}

impl Store {
    pub async fn create_handoff_logged(
        &self,
        handoff: &Handoff,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let h = handoff.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO handoffs (id, issue_id, session_id, done, remaining, decisions, uncertain, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        h.id,
                        h.issue_id,
                        h.session_id,
                        list_json(&h.done),
                        list_json(&h.remaining),
                        list_json(&h.decisions),
                        list_json(&h.uncertain),
                        h.timestamp.to_rfc3339(),
                    ],
                )?;
                log_action_tx(&tx, &session, ActionType::Create, "handoffs", &h.id, None, Some(&handoff_record(&h)))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// The effective handoff: latest by timestamp.
    pub async fn latest_handoff(&self, issue_id: &str) -> Result<Option<Handoff>, StoreError> {
        let issue = issue_id.to_string();
        self.connection()
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let h = conn
                    .query_row(
                        "SELECT id, issue_id, session_id, done, remaining, decisions, uncertain, timestamp
                         FROM handoffs WHERE issue_id = ?1
                         ORDER BY timestamp DESC LIMIT 1",
                        rusqlite::params![issue],
                        row_to_handoff,
                    )
                    .optional()?;
                Ok(h)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

fn comment_record(c: &Comment) -> Value {
    serde_json::json!({
        "id": c.id,
        "issue_id": c.issue_id,
        "session_id": c.session_id,
        "text": c.text,
        "created_at": c.created_at.to_rfc3339(),
    })
}

impl Store {
    pub async fn create_comment_logged(
        &self,
        comment: &Comment,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let c = comment.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO comments (id, issue_id, session_id, text, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![c.id, c.issue_id, c.session_id, c.text, c.created_at.to_rfc3339()],
                )?;
                log_action_tx(&tx, &session, ActionType::Create, "comments", &c.id, None, Some(&comment_record(&c)))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    pub async fn list_comments(&self, issue_id: &str) -> Result<Vec<Comment>, StoreError> {
        let issue = issue_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, issue_id, session_id, text, created_at
                     FROM comments WHERE issue_id = ?1 ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![issue])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let created: String = row.get(4)?;
                    out.push(Comment {
                        id: row.get(0)?,
                        issue_id: row.get(1)?,
                        session_id: row.get(2)?,
                        text: row.get(3)?,
                        created_at: parse_ts(&created),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

impl Store {
    /// Record a dependency edge. The inverse semantic is derivable via
    /// [`DepKind::inverse`]; only the stated edge is stored.
    pub async fn add_dependency_logged(
        &self,
        dep: &Dependency,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let dep = dep.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT OR IGNORE INTO dependencies (id, from_issue, to_issue, kind)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, dep.from_issue, dep.to_issue, dep.kind.as_str()],
                )?;
                let record = serde_json::json!({
                    "id": id,
                    "from_issue": dep.from_issue,
                    "to_issue": dep.to_issue,
                    "kind": dep.kind.as_str(),
                });
                log_action_tx(&tx, &session, ActionType::Create, "dependencies", &id, None, Some(&record))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// All stored edges.
    pub async fn list_dependencies(&self) -> Result<Vec<Dependency>, StoreError> {
        self.connection()
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT from_issue, to_issue, kind FROM dependencies")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let kind: String = row.get(2)?;
                    out.push(Dependency {
                        from_issue: row.get(0)?,
                        to_issue: row.get(1)?,
                        kind: if kind == "depends_on" { DepKind::DependsOn } else { DepKind::Blocks },
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Boards
// ---------------------------------------------------------------------------

impl Store {
    pub async fn create_board_logged(
        &self,
        board: &Board,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let b = board.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO boards (id, name, query, created_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![b.id, b.name, b.query, b.created_at.to_rfc3339()],
                )?;
                let record = serde_json::json!({
                    "id": b.id,
                    "name": b.name,
                    "query": b.query,
                    "created_at": b.created_at.to_rfc3339(),
                });
                log_action_tx(&tx, &session, ActionType::Create, "boards", &b.id, None, Some(&record))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    pub async fn list_boards(&self) -> Result<Vec<Board>, StoreError> {
        self.connection()
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, query, created_at FROM boards ORDER BY name")?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let created: String = row.get(3)?;
                    out.push(Board {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        query: row.get(2)?,
                        created_at: parse_ts(&created),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    /// Place (or move) an issue on a board. Position is a sparse i64; pass
    /// `None` to append after the current maximum with the standard gap.
    pub async fn set_board_position_logged(
        &self,
        board_id: &str,
        issue_id: &str,
        position: Option<i64>,
        session_id: &str,
    ) -> Result<BoardPosition, StoreError> {
        let board = board_id.to_string();
        let issue = issue_id.to_string();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let position = match position {
                    Some(p) => p,
                    None => {
                        let max: i64 = tx.query_row(
                            "SELECT COALESCE(MAX(position), 0) FROM board_positions WHERE board_id = ?1",
                            rusqlite::params![board],
                            |r| r.get(0),
                        )?;
                        max + BOARD_POSITION_GAP
                    }
                };
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT OR REPLACE INTO board_positions (id, board_id, issue_id, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, board, issue, position],
                )?;
                let record = serde_json::json!({
                    "id": id,
                    "board_id": board,
                    "issue_id": issue,
                    "position": position,
                });
                log_action_tx(&tx, &session, ActionType::Update, "board_positions", &id, None, Some(&record))?;
                tx.commit()?;
                Ok(BoardPosition { board_id: board, issue_id: issue, position })
            })
            .await
            .map_err(from_call)
    }

    /// Board contents in position order.
    pub async fn board_positions(&self, board_id: &str) -> Result<Vec<BoardPosition>, StoreError> {
        let board = board_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT board_id, issue_id, position FROM board_positions
                     WHERE board_id = ?1 ORDER BY position ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![board])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(BoardPosition {
                        board_id: row.get(0)?,
                        issue_id: row.get(1)?,
                        position: row.get(2)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Work sessions
// ---------------------------------------------------------------------------

fn work_session_record(w: &WorkSession) -> Value {
    serde_json::json!({
        "id": w.id,
        "name": w.name,
        "session_id": w.session_id,
        "started_at": w.started_at.to_rfc3339(),
        "ended_at": w.ended_at.map(|t| t.to_rfc3339()),
        "start_sha": w.start_sha,
        "end_sha": w.end_sha,
    })
}

fn row_to_work_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkSession> {
    let started: String = row.get(3)?;
    Ok(WorkSession {
        id: row.get(0)?,
        name: row.get(1)?,
        session_id: row.get(2)?,
        started_at: parse_ts(&started),
        ended_at: parse_ts_opt(row.get(4)?),
        start_sha: row.get(5)?,
        end_sha: row.get(6)?,
    })
}

impl Store {
    pub async fn start_work_session_logged(
        &self,
        work: &WorkSession,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let w = work.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO work_sessions (id, name, session_id, started_at, ended_at, start_sha, end_sha)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        w.id,
                        w.name,
                        w.session_id,
                        w.started_at.to_rfc3339(),
                        w.ended_at.map(|t| t.to_rfc3339()),
                        w.start_sha,
                        w.end_sha,
                    ],
                )?;
                log_action_tx(&tx, &session, ActionType::Create, "work_sessions", &w.id, None, Some(&work_session_record(&w)))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Close a work session, stamping `ended_at` and the final SHA.
    pub async fn end_work_session_logged(
        &self,
        id: &str,
        end_sha: Option<String>,
        session_id: &str,
    ) -> Result<WorkSession, StoreError> {
        let id = id.to_string();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let tx = conn.transaction()?;
                let previous = tx
                    .query_row(
                        "SELECT id, name, session_id, started_at, ended_at, start_sha, end_sha
                         FROM work_sessions WHERE id = ?1",
                        rusqlite::params![id],
                        row_to_work_session,
                    )
                    .optional()?
                    .ok_or_else(|| StoreError::NotFound { entity: "work_session", id: id.clone() })?;
                let mut updated = previous.clone();
                updated.ended_at = Some(Utc::now());
                updated.end_sha = end_sha.clone();
                tx.execute(
                    "UPDATE work_sessions SET ended_at = ?1, end_sha = ?2 WHERE id = ?3",
                    rusqlite::params![
                        updated.ended_at.map(|t| t.to_rfc3339()),
                        updated.end_sha,
                        id
                    ],
                )?;
                log_action_tx(
                    &tx,
                    &session,
                    ActionType::Update,
                    "work_sessions",
                    &id,
                    Some(&work_session_record(&previous)),
                    Some(&work_session_record(&updated)),
                )?;
                tx.commit()?;
                Ok(updated)
            })
            .await
            .map_err(from_call)
    }

    /// The open work session for an identity, if any.
    pub async fn active_work_session(
        &self,
        session_id: &str,
    ) -> Result<Option<WorkSession>, StoreError> {
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let w = conn
                    .query_row(
                        "SELECT id, name, session_id, started_at, ended_at, start_sha, end_sha
                         FROM work_sessions WHERE session_id = ?1 AND ended_at IS NULL
                         ORDER BY started_at DESC LIMIT 1",
                        rusqlite::params![session],
                        row_to_work_session,
                    )
                    .optional()?;
                Ok(w)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Git snapshots & issue files
// ---------------------------------------------------------------------------

impl Store {
    pub async fn record_git_snapshot_logged(
        &self,
        snapshot: &GitSnapshot,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let s = snapshot.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = Uuid::new_v4().to_string();
                tx.execute(
                    "INSERT INTO git_snapshots (id, issue_id, event, commit_sha, branch, dirty_files, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        id,
                        s.issue_id,
                        match s.event {
                            GitEvent::Start => "start",
                            GitEvent::Review => "review",
                            GitEvent::Close => "close",
                        },
                        s.commit_sha,
                        s.branch,
                        s.dirty_files,
                        s.timestamp.to_rfc3339(),
                    ],
                )?;
                let record = serde_json::json!({
                    "id": id,
                    "issue_id": s.issue_id,
                    "event": match s.event {
                        GitEvent::Start => "start",
                        GitEvent::Review => "review",
                        GitEvent::Close => "close",
                    },
                    "commit_sha": s.commit_sha,
                    "branch": s.branch,
                    "dirty_files": s.dirty_files,
                    "timestamp": s.timestamp.to_rfc3339(),
                });
                log_action_tx(&tx, &session, ActionType::Create, "git_snapshots", &id, None, Some(&record))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    pub async fn list_git_snapshots(&self, issue_id: &str) -> Result<Vec<GitSnapshot>, StoreError> {
        let issue = issue_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT issue_id, event, commit_sha, branch, dirty_files, timestamp
                     FROM git_snapshots WHERE issue_id = ?1 ORDER BY timestamp ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![issue])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let event: String = row.get(1)?;
                    let ts: String = row.get(5)?;
                    out.push(GitSnapshot {
                        issue_id: row.get(0)?,
                        event: match event.as_str() {
                            "review" => GitEvent::Review,
                            "close" => GitEvent::Close,
                            _ => GitEvent::Start,
                        },
                        commit_sha: row.get(2)?,
                        branch: row.get(3)?,
                        dirty_files: row.get(4)?,
                        timestamp: parse_ts(&ts),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    pub async fn link_file_logged(
        &self,
        file: &IssueFile,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let f = file.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = Uuid::new_v4().to_string();
                let role = match f.role {
                    FileRole::Implementation => "implementation",
                    FileRole::Test => "test",
                    FileRole::Reference => "reference",
                    FileRole::Config => "config",
                };
                tx.execute(
                    "INSERT OR REPLACE INTO issue_files (id, issue_id, file_path, role, linked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id, f.issue_id, f.file_path, role, f.linked_at.to_rfc3339()],
                )?;
                let record = serde_json::json!({
                    "id": id,
                    "issue_id": f.issue_id,
                    "file_path": f.file_path,
                    "role": role,
                    "linked_at": f.linked_at.to_rfc3339(),
                });
                log_action_tx(&tx, &session, ActionType::Create, "issue_files", &id, None, Some(&record))?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    pub async fn list_issue_files(&self, issue_id: &str) -> Result<Vec<IssueFile>, StoreError> {
        let issue = issue_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT issue_id, file_path, role, linked_at FROM issue_files
                     WHERE issue_id = ?1 ORDER BY file_path",
                )?;
                let mut rows = stmt.query(rusqlite::params![issue])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let role: String = row.get(2)?;
                    let linked: String = row.get(3)?;
                    out.push(IssueFile {
                        issue_id: row.get(0)?,
                        file_path: row.get(1)?,
                        role: FileRole::parse(&role).unwrap_or(FileRole::Reference),
                        linked_at: parse_ts(&linked),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use td_core::types::Issue;

    #[tokio::test]
    async fn log_attaches_to_issue() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_issue_logged(&Issue::new("td-1", "x", "s1"), "s1").await.unwrap();

        let mut log = LogEntry::new("l1", "s1", "tried the obvious fix", LogType::Tried);
        log.issue_id = Some("td-1".into());
        store.create_log_logged(&log, "s1").await.unwrap();

        let logs = store.list_logs(Some("td-1")).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_type, LogType::Tried);
        assert!(store.list_logs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn latest_handoff_by_timestamp() {
        let store = Store::open_in_memory().await.unwrap();
        let mut first = Handoff::new("h1", "td-1", "s1");
        first.done.push("schema".into());
        first.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let mut second = Handoff::new("h2", "td-1", "s2");
        second.remaining.push("apply loop".into());

        store.create_handoff_logged(&first, "s1").await.unwrap();
        store.create_handoff_logged(&second, "s2").await.unwrap();

        let latest = store.latest_handoff("td-1").await.unwrap().unwrap();
        assert_eq!(latest.id, "h2");
        assert_eq!(latest.remaining, vec!["apply loop"]);
    }

    #[tokio::test]
    async fn comments_in_creation_order() {
        let store = Store::open_in_memory().await.unwrap();
        let c1 = Comment {
            id: "c1".into(),
            issue_id: "td-1".into(),
            session_id: "s1".into(),
            text: "first".into(),
            created_at: Utc::now() - chrono::Duration::minutes(1),
        };
        let c2 = Comment { id: "c2".into(), text: "second".into(), created_at: Utc::now(), ..c1.clone() };
        store.create_comment_logged(&c1, "s1").await.unwrap();
        store.create_comment_logged(&c2, "s1").await.unwrap();

        let comments = store.list_comments("td-1").await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "first");
    }

    #[tokio::test]
    async fn duplicate_dependency_is_ignored() {
        let store = Store::open_in_memory().await.unwrap();
        let dep = Dependency { from_issue: "td-1".into(), to_issue: "td-2".into(), kind: DepKind::Blocks };
        store.add_dependency_logged(&dep, "s1").await.unwrap();
        store.add_dependency_logged(&dep, "s1").await.unwrap();
        assert_eq!(store.list_dependencies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn board_positions_append_with_gap() {
        let store = Store::open_in_memory().await.unwrap();
        let board = Board { id: "b1".into(), name: "sprint".into(), query: None, created_at: Utc::now() };
        store.create_board_logged(&board, "s1").await.unwrap();

        let p1 = store.set_board_position_logged("b1", "td-1", None, "s1").await.unwrap();
        let p2 = store.set_board_position_logged("b1", "td-2", None, "s1").await.unwrap();
        assert_eq!(p1.position, BOARD_POSITION_GAP);
        assert_eq!(p2.position, 2 * BOARD_POSITION_GAP);

        // Explicit placement between the two.
        let mid = store
            .set_board_position_logged("b1", "td-3", Some(BOARD_POSITION_GAP + 10), "s1")
            .await
            .unwrap();
        assert_eq!(mid.position, BOARD_POSITION_GAP + 10);

        let ordered: Vec<String> = store
            .board_positions("b1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.issue_id)
            .collect();
        assert_eq!(ordered, vec!["td-1", "td-3", "td-2"]);
    }

    #[tokio::test]
    async fn work_session_lifecycle() {
        let store = Store::open_in_memory().await.unwrap();
        let mut w = WorkSession::new("w1", "sync engine", "s1");
        w.start_sha = Some("abc123".into());
        store.start_work_session_logged(&w, "s1").await.unwrap();

        let active = store.active_work_session("s1").await.unwrap().unwrap();
        assert_eq!(active.id, "w1");

        let ended = store
            .end_work_session_logged("w1", Some("def456".into()), "s1")
            .await
            .unwrap();
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.end_sha.as_deref(), Some("def456"));
        assert!(store.active_work_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn git_snapshots_in_time_order() {
        let store = Store::open_in_memory().await.unwrap();
        let start = GitSnapshot {
            issue_id: "td-1".into(),
            event: GitEvent::Start,
            commit_sha: "abc".into(),
            branch: "main".into(),
            dirty_files: 2,
            timestamp: Utc::now() - chrono::Duration::minutes(10),
        };
        let review = GitSnapshot {
            event: GitEvent::Review,
            commit_sha: "def".into(),
            timestamp: Utc::now(),
            ..start.clone()
        };
        store.record_git_snapshot_logged(&start, "s1").await.unwrap();
        store.record_git_snapshot_logged(&review, "s1").await.unwrap();

        let snapshots = store.list_git_snapshots("td-1").await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].event, GitEvent::Start);
        assert_eq!(snapshots[1].commit_sha, "def");
    }

    #[tokio::test]
    async fn issue_file_relink_replaces_role() {
        let store = Store::open_in_memory().await.unwrap();
        let file = IssueFile {
            issue_id: "td-1".into(),
            file_path: "src/sync.rs".into(),
            role: FileRole::Implementation,
            linked_at: Utc::now(),
        };
        store.link_file_logged(&file, "s1").await.unwrap();
        let relinked = IssueFile { role: FileRole::Test, ..file.clone() };
        store.link_file_logged(&relinked, "s1").await.unwrap();

        let files = store.list_issue_files("td-1").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].role, FileRole::Test);
    }
}

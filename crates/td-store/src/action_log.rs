//! The local action log.
//!
//! An append-only journal of every entity mutation, written in the same
//! transaction as the entity change. Rowids are assigned by SQLite and give
//! the total local order; they double as the client action id in sync acks.
//! Rows are mutated only to set `undone` (local undo) or `synced_at` /
//! `server_seq` (push acknowledgment).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{from_call, StoreError};
use crate::store::{parse_ts, parse_ts_opt, Store};

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

/// Domain action verbs. The wire protocol only knows four generic verbs;
/// [`ActionType::wire_verb`] performs the export mapping while the journal
/// keeps the domain meaning for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    SoftDelete,
    Start,
    Review,
    Approve,
    Close,
    Reopen,
    Block,
    Unblock,
    Reject,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
            ActionType::SoftDelete => "soft_delete",
            ActionType::Start => "start",
            ActionType::Review => "review",
            ActionType::Approve => "approve",
            ActionType::Close => "close",
            ActionType::Reopen => "reopen",
            ActionType::Block => "block",
            ActionType::Unblock => "unblock",
            ActionType::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<ActionType> {
        match s {
            "create" => Some(ActionType::Create),
            "update" => Some(ActionType::Update),
            "delete" => Some(ActionType::Delete),
            "soft_delete" => Some(ActionType::SoftDelete),
            "start" => Some(ActionType::Start),
            "review" => Some(ActionType::Review),
            "approve" => Some(ActionType::Approve),
            "close" => Some(ActionType::Close),
            "reopen" => Some(ActionType::Reopen),
            "block" => Some(ActionType::Block),
            "unblock" => Some(ActionType::Unblock),
            "reject" => Some(ActionType::Reject),
            _ => None,
        }
    }

    /// The generic verb this action exports as: domain transitions collapse
    /// to `update`; the structural verbs pass through.
    pub fn wire_verb(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Delete => "delete",
            ActionType::SoftDelete => "soft_delete",
            _ => "update",
        }
    }
}

// ---------------------------------------------------------------------------
// ActionEntry
// ---------------------------------------------------------------------------

/// One journal row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    /// SQLite rowid: the local order and the client action id.
    pub rowid: i64,
    pub id: String,
    pub session_id: String,
    pub action_type: ActionType,
    pub entity_type: String,
    pub entity_id: String,
    pub previous_data: Option<Value>,
    pub new_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub undone: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub server_seq: Option<i64>,
}

/// A push acknowledgment: the journal row and its assigned server sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub client_action_id: i64,
    pub server_seq: i64,
}

// ---------------------------------------------------------------------------
// Transaction-scoped insert
// ---------------------------------------------------------------------------

/// Insert a journal row inside the caller's transaction. Returns the rowid.
pub(crate) fn log_action_tx(
    conn: &rusqlite::Connection,
    session_id: &str,
    action_type: ActionType,
    entity_type: &str,
    entity_id: &str,
    previous_data: Option<&Value>,
    new_data: Option<&Value>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO action_log
            (id, session_id, action_type, entity_type, entity_id,
             previous_data, new_data, timestamp, undone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            session_id,
            action_type.as_str(),
            entity_type,
            entity_id,
            previous_data.map(|v| v.to_string()),
            new_data.map(|v| v.to_string()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionEntry> {
    let action_str: String = row.get(3)?;
    let previous: Option<String> = row.get(6)?;
    let new: Option<String> = row.get(7)?;
    let ts: String = row.get(8)?;
    let synced: Option<String> = row.get(10)?;
    Ok(ActionEntry {
        rowid: row.get(0)?,
        id: row.get(1)?,
        session_id: row.get(2)?,
        action_type: ActionType::parse(&action_str).unwrap_or(ActionType::Update),
        entity_type: row.get(4)?,
        entity_id: row.get(5)?,
        previous_data: previous.and_then(|s| serde_json::from_str(&s).ok()),
        new_data: new.and_then(|s| serde_json::from_str(&s).ok()),
        timestamp: parse_ts(&ts),
        undone: row.get::<_, i64>(9)? != 0,
        synced_at: parse_ts_opt(synced),
        server_seq: row.get(11)?,
    })
}

const ENTRY_COLUMNS: &str = "rowid, id, session_id, action_type, entity_type, entity_id,
                             previous_data, new_data, timestamp, undone, synced_at, server_seq";

/// Write a full pre-image back: columns sorted, positional bindings,
/// `INSERT OR REPLACE` (the same deterministic shape the sync apply uses).
fn restore_record(
    conn: &rusqlite::Connection,
    entity_type: &str,
    entity_id: &str,
    record: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    let id_value = Value::String(entity_id.to_string());
    let mut fields: Vec<(&str, &Value)> = record
        .iter()
        .filter(|(k, _)| k.as_str() != "id")
        .map(|(k, v)| (k.as_str(), v))
        .collect();
    fields.push(("id", &id_value));
    fields.sort_by(|a, b| a.0.cmp(b.0));

    let columns: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
    let marks: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
    let mut bindings: Vec<rusqlite::types::Value> = Vec::with_capacity(fields.len());
    for (column, value) in &fields {
        let bound = match value {
            Value::Null => rusqlite::types::Value::Null,
            Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => rusqlite::types::Value::Integer(i),
                (None, Some(f)) => rusqlite::types::Value::Real(f),
                _ => return Err(format!("unbindable number for column {column}")),
            },
            Value::String(s) => rusqlite::types::Value::Text(s.clone()),
            _ => return Err(format!("unbindable value for column {column}")),
        };
        bindings.push(bound);
    }

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {entity_type} ({}) VALUES ({})",
            columns.join(", "),
            marks.join(", ")
        ),
        rusqlite::params_from_iter(bindings),
    )
    .map_err(|e| e.to_string())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl Store {
    /// Journal rows eligible for push: not undone and never acknowledged,
    /// in local commit order.
    pub async fn pending_actions(&self) -> Result<Vec<ActionEntry>, StoreError> {
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM action_log
                     WHERE undone = 0 AND synced_at IS NULL
                     ORDER BY rowid ASC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    /// Record push acknowledgments: set `synced_at` and `server_seq` on each
    /// acked row, atomically for the batch.
    pub async fn mark_events_synced(&self, acks: Vec<SyncAck>) -> Result<(), StoreError> {
        if acks.is_empty() {
            return Ok(());
        }
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let now = Utc::now().to_rfc3339();
                for ack in &acks {
                    tx.execute(
                        "UPDATE action_log SET synced_at = ?1, server_seq = ?2 WHERE rowid = ?3",
                        rusqlite::params![now, ack.server_seq, ack.client_action_id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Journal rows created at or after `since` (webhook batching).
    pub async fn actions_since(&self, since: DateTime<Utc>) -> Result<Vec<ActionEntry>, StoreError> {
        let since = since.to_rfc3339();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM action_log
                     WHERE timestamp >= ?1 ORDER BY rowid ASC"
                ))?;
                let mut rows = stmt.query(rusqlite::params![since])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    /// The most recent not-undone action by `session_id` (undo target).
    pub async fn last_action(&self, session_id: &str) -> Result<Option<ActionEntry>, StoreError> {
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                let entry = conn
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM action_log
                             WHERE session_id = ?1 AND undone = 0
                             ORDER BY rowid DESC LIMIT 1"
                        ),
                        rusqlite::params![session],
                        row_to_entry,
                    )
                    .optional()?;
                Ok(entry)
            })
            .await
            .map_err(from_call)
    }

    /// Undo one journal row: restore the entity to its pre-image (or remove
    /// it when the action created it) and mark the row undone, atomically.
    /// History is preserved; the row simply stops being eligible for push.
    pub async fn undo_action(&self, entry: &ActionEntry) -> Result<(), StoreError> {
        if !crate::is_replicated_table(&entry.entity_type) {
            return Err(StoreError::Invalid(format!(
                "cannot undo action on {}",
                entry.entity_type
            )));
        }
        let entry = entry.clone();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                match &entry.previous_data {
                    Some(Value::Object(record)) => {
                        restore_record(&tx, &entry.entity_type, &entry.entity_id, record)
                            .map_err(StoreError::Invalid)?;
                    }
                    _ => {
                        tx.execute(
                            &format!("DELETE FROM {} WHERE id = ?1", entry.entity_type),
                            rusqlite::params![entry.entity_id],
                        )?;
                    }
                }
                tx.execute(
                    "UPDATE action_log SET undone = 1 WHERE rowid = ?1",
                    rusqlite::params![entry.rowid],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Mark a journal row undone. History is preserved; the row simply stops
    /// being eligible for push.
    pub async fn mark_action_undone(&self, rowid: i64) -> Result<(), StoreError> {
        self.connection()
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE action_log SET undone = 1 WHERE rowid = ?1",
                    rusqlite::params![rowid],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound {
                        entity: "action",
                        id: rowid.to_string(),
                    }
                    .into());
                }
                Ok(())
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
    async fn wire_verb_mapping() {
        assert_eq!(ActionType::Create.wire_verb(), "create");
        assert_eq!(ActionType::Delete.wire_verb(), "delete");
        assert_eq!(ActionType::SoftDelete.wire_verb(), "soft_delete");
        for domain in [
            ActionType::Update,
            ActionType::Start,
            ActionType::Review,
            ActionType::Approve,
            ActionType::Close,
            ActionType::Reopen,
            ActionType::Block,
            ActionType::Unblock,
            ActionType::Reject,
        ] {
            assert_eq!(domain.wire_verb(), "update");
        }
    }

    #[tokio::test]
    async fn pending_excludes_undone_and_synced() {
        let store = Store::open_in_memory().await.unwrap();
        let a = Issue::new("td-1", "a", "s1");
        let b = Issue::new("td-2", "b", "s1");
        let c = Issue::new("td-3", "c", "s1");
        store.create_issue_logged(&a, "s1").await.unwrap();
        store.create_issue_logged(&b, "s1").await.unwrap();
        store.create_issue_logged(&c, "s1").await.unwrap();

        let pending = store.pending_actions().await.unwrap();
        assert_eq!(pending.len(), 3);
        // Rowids strictly increasing in insertion order.
        assert!(pending.windows(2).all(|w| w[0].rowid < w[1].rowid));

        store.mark_action_undone(pending[0].rowid).await.unwrap();
        store
            .mark_events_synced(vec![SyncAck { client_action_id: pending[1].rowid, server_seq: 7 }])
            .await
            .unwrap();

        let pending = store.pending_actions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "td-3");
    }

    #[tokio::test]
    async fn acked_rows_carry_server_seq() {
        let store = Store::open_in_memory().await.unwrap();
        let a = Issue::new("td-1", "a", "s1");
        store.create_issue_logged(&a, "s1").await.unwrap();
        let rowid = store.pending_actions().await.unwrap()[0].rowid;

        store
            .mark_events_synced(vec![SyncAck { client_action_id: rowid, server_seq: 99 }])
            .await
            .unwrap();

        let since = store
            .actions_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].server_seq, Some(99));
        assert!(since[0].synced_at.is_some());
    }

    #[tokio::test]
    async fn last_action_scoped_to_session() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_issue_logged(&Issue::new("td-1", "a", "s1"), "s1").await.unwrap();
        store.create_issue_logged(&Issue::new("td-2", "b", "s2"), "s2").await.unwrap();

        let last = store.last_action("s1").await.unwrap().unwrap();
        assert_eq!(last.entity_id, "td-1");
        assert!(store.last_action("s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undo_update_restores_pre_image() {
        let store = Store::open_in_memory().await.unwrap();
        let mut issue = Issue::new("td-1", "original title", "s1");
        store.create_issue_logged(&issue, "s1").await.unwrap();

        issue.title = "renamed".into();
        store.update_issue_logged(&issue, "s1", ActionType::Update).await.unwrap();
        assert_eq!(store.get_issue("td-1").await.unwrap().unwrap().title, "renamed");

        let last = store.last_action("s1").await.unwrap().unwrap();
        store.undo_action(&last).await.unwrap();
        assert_eq!(store.get_issue("td-1").await.unwrap().unwrap().title, "original title");

        // The undone row is out of the push set; the create remains.
        let pending = store.pending_actions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Create);
    }

    #[tokio::test]
    async fn undo_create_removes_the_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_issue_logged(&Issue::new("td-1", "x", "s1"), "s1").await.unwrap();
        let last = store.last_action("s1").await.unwrap().unwrap();
        store.undo_action(&last).await.unwrap();
        assert!(store.get_issue("td-1").await.unwrap().is_none());
        assert!(store.pending_actions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undo_missing_row_errors() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(matches!(
            store.mark_action_undone(12345).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}

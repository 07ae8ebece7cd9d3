//! Applying remote events to the local entity store.
//!
//! Application is deterministic (columns sorted, positional bindings),
//! ordered by `server_seq`, and idempotent (`INSERT OR REPLACE`), which is
//! what makes the convergence contract hold: two clients that applied the
//! same event prefix hold byte-identical entity tables.
//!
//! Each event runs under its own savepoint. A failing event rolls back only
//! its own mutation, is recorded in `ApplyResult.failed`, and never aborts
//! the batch; the watermark advances past it.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use td_store::Store;

use crate::protocol::{ApplyFailure, ApplyResult, Event, PAYLOAD_SCHEMA_VERSION};
use crate::{from_call, SyncError};

/// Entity-type validator: returns `true` when the type names a table this
/// client replicates. A plain fn pointer so it crosses the connection-thread
/// boundary.
pub type EntityValidator = fn(&str) -> bool;

/// Apply `events` (ascending `server_seq`) inside one client transaction.
pub async fn apply_remote_events(
    store: &Store,
    events: Vec<Event>,
    validator: EntityValidator,
) -> Result<ApplyResult, SyncError> {
    if events.is_empty() {
        return Ok(ApplyResult::default());
    }
    store
        .connection()
        .call(move |conn| {
            let mut tx = conn.transaction()?;
            let mut result = ApplyResult::default();
            for event in &events {
                result.last_applied_seq = result.last_applied_seq.max(event.server_seq);
                let outcome = {
                    let sp = tx.savepoint()?;
                    match apply_one(&sp, event, validator) {
                        Ok(()) => {
                            sp.commit()?;
                            Ok(())
                        }
                        // Savepoint drop rolls the event's mutation back.
                        Err(reason) => Err(reason),
                    }
                };
                match outcome {
                    Ok(()) => result.applied += 1,
                    Err(reason) => {
                        tracing::warn!(
                            server_seq = event.server_seq,
                            entity = %event.entity_type,
                            %reason,
                            "remote event rejected"
                        );
                        result.failed.push(ApplyFailure { server_seq: event.server_seq, reason });
                    }
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(from_call)
}

// ---------------------------------------------------------------------------
// Single-event application
// ---------------------------------------------------------------------------

fn apply_one(
    conn: &rusqlite::Connection,
    event: &Event,
    validator: EntityValidator,
) -> Result<(), String> {
    if !validator(&event.entity_type) {
        return Err(format!("invalid entity type: {}", event.entity_type));
    }
    if event.entity_id.trim().is_empty() {
        return Err("empty entity id".into());
    }

    match event.action_type.as_str() {
        "create" | "update" => upsert(conn, event),
        "delete" => {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", event.entity_type),
                rusqlite::params![event.entity_id],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        }
        "soft_delete" => {
            conn.execute(
                &format!("UPDATE {} SET deleted_at = ?1 WHERE id = ?2", event.entity_type),
                rusqlite::params![event.client_timestamp.to_rfc3339(), event.entity_id],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        }
        other => Err(format!("unknown action type: {other}")),
    }
}

/// Deterministic whole-row upsert: columns sorted alphabetically, positional
/// bindings, `INSERT OR REPLACE`.
fn upsert(conn: &rusqlite::Connection, event: &Event) -> Result<(), String> {
    let schema_version = event.payload.get("schema_version").and_then(Value::as_i64);
    if schema_version != Some(PAYLOAD_SCHEMA_VERSION) {
        return Err(format!(
            "unsupported payload schema version: {}",
            schema_version.map_or_else(|| "missing".into(), |v| v.to_string())
        ));
    }

    let Some(Value::Object(new_data)) = event.payload.get("new_data") else {
        return Err("payload new_data is not an object".into());
    };

    let mut fields: Vec<(&str, &Value)> =
        new_data.iter().map(|(k, v)| (k.as_str(), v)).collect();
    if fields.is_empty() {
        return Err("payload new_data has no fields".into());
    }

    // The row id always comes from the event envelope.
    let id_value = Value::String(event.entity_id.clone());
    fields.retain(|(k, _)| *k != "id");
    fields.push(("id", &id_value));

    for (column, _) in &fields {
        if !is_identifier(column) {
            return Err(format!("invalid column name: {column}"));
        }
    }
    fields.sort_by(|a, b| a.0.cmp(b.0));

    let columns: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
    let marks: Vec<String> = (1..=fields.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        event.entity_type,
        columns.join(", "),
        marks.join(", ")
    );

    let mut bindings = Vec::with_capacity(fields.len());
    for (column, value) in &fields {
        bindings.push(bind_value(value).ok_or_else(|| {
            format!("unbindable value for column {column}")
        })?);
    }

    conn.execute(&sql, rusqlite::params_from_iter(bindings))
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// JSON scalar -> SQLite binding. Composite values are rejected; payloads
/// encode lists as JSON strings.
fn bind_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => Some(SqlValue::Null),
        Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(SqlValue::Integer(i))
            } else {
                n.as_f64().map(SqlValue::Real)
            }
        }
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use td_store::is_replicated_table;

    fn event(seq: i64, action: &str, entity_type: &str, entity_id: &str, new_data: Value) -> Event {
        Event {
            server_seq: seq,
            device_id: "remote".into(),
            session_id: "s1".into(),
            client_action_id: seq,
            action_type: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload: serde_json::json!({
                "schema_version": 1,
                "new_data": new_data,
                "previous_data": null,
            }),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
        }
    }

    fn create_issue(seq: i64, id: &str, title: &str) -> Event {
        event(
            seq,
            "create",
            "issues",
            id,
            serde_json::json!({
                "id": id,
                "title": title,
                "status": "open",
                "created_at": Utc::now().to_rfc3339(),
                "updated_at": Utc::now().to_rfc3339(),
            }),
        )
    }

    #[test]
    fn identifier_grammar() {
        assert!(is_identifier("title"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("col_2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2col"));
        assert!(!is_identifier("drop table"));
        assert!(!is_identifier("a;b"));
    }

    #[tokio::test]
    async fn create_then_read_back() {
        let store = Store::open_in_memory().await.unwrap();
        let result = apply_remote_events(
            &store,
            vec![create_issue(1, "td-1", "remote issue")],
            is_replicated_table,
        )
        .await
        .unwrap();
        assert_eq!(result.applied, 1);
        assert!(result.failed.is_empty());
        assert_eq!(result.last_applied_seq, 1);

        let issue = store.get_issue("td-1").await.unwrap().unwrap();
        assert_eq!(issue.title, "remote issue");
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let e = create_issue(1, "td-1", "same");
        apply_remote_events(&store, vec![e.clone()], is_replicated_table).await.unwrap();
        apply_remote_events(&store, vec![e], is_replicated_table).await.unwrap();

        let issues = store
            .list_issues(&td_store::IssueFilter { include_deleted: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "same");
    }

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let store = Store::open_in_memory().await.unwrap();
        let batch = vec![
            create_issue(1, "id1", "first"),
            event(2, "create", "nonexistent_table", "x", serde_json::json!({"id": "x"})),
            create_issue(3, "id2", "second"),
        ];
        let result = apply_remote_events(&store, batch, is_replicated_table).await.unwrap();
        assert_eq!(result.applied, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].server_seq, 2);
        assert_eq!(result.last_applied_seq, 3);

        assert!(store.get_issue("id1").await.unwrap().is_some());
        assert!(store.get_issue("id2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_bad_events_without_aborting() {
        let store = Store::open_in_memory().await.unwrap();
        let mut no_version = create_issue(1, "td-1", "x");
        no_version.payload = serde_json::json!({"new_data": {"id": "td-1"}});
        let batch = vec![
            no_version,
            event(2, "create", "issues", "", serde_json::json!({"id": ""})),
            event(3, "explode", "issues", "td-2", serde_json::json!({"id": "td-2"})),
            event(4, "create", "issues", "td-3", serde_json::json!({})),
            event(5, "create", "issues", "td-4", serde_json::json!({"bad-col!": 1})),
            create_issue(6, "td-5", "survivor"),
        ];
        let result = apply_remote_events(&store, batch, is_replicated_table).await.unwrap();
        assert_eq!(result.applied, 1);
        assert_eq!(result.failed.len(), 5);
        assert_eq!(result.last_applied_seq, 6);
        assert!(store.get_issue("td-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn soft_delete_sets_tombstone_and_delete_removes() {
        let store = Store::open_in_memory().await.unwrap();
        apply_remote_events(&store, vec![create_issue(1, "td-1", "x")], is_replicated_table)
            .await
            .unwrap();

        let soft = event(2, "soft_delete", "issues", "td-1", serde_json::json!({}));
        apply_remote_events(&store, vec![soft], is_replicated_table).await.unwrap();
        let issue = store.get_issue("td-1").await.unwrap().unwrap();
        assert!(issue.deleted_at.is_some());

        let hard = event(3, "delete", "issues", "td-1", serde_json::json!({}));
        apply_remote_events(&store, vec![hard], is_replicated_table).await.unwrap();
        assert!(store.get_issue("td-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_absent_row_is_a_no_op() {
        let store = Store::open_in_memory().await.unwrap();
        let batch = vec![
            event(1, "delete", "issues", "ghost", serde_json::json!({})),
            event(2, "soft_delete", "issues", "ghost", serde_json::json!({})),
        ];
        let result = apply_remote_events(&store, batch, is_replicated_table).await.unwrap();
        assert_eq!(result.applied, 2);
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn newer_create_clears_tombstone() {
        let store = Store::open_in_memory().await.unwrap();
        apply_remote_events(&store, vec![create_issue(1, "td-1", "v1")], is_replicated_table)
            .await
            .unwrap();
        apply_remote_events(
            &store,
            vec![event(2, "soft_delete", "issues", "td-1", serde_json::json!({}))],
            is_replicated_table,
        )
        .await
        .unwrap();

        // Re-create with a full row whose deleted_at is null.
        let mut recreate = create_issue(3, "td-1", "v2");
        recreate.payload["new_data"]["deleted_at"] = Value::Null;
        apply_remote_events(&store, vec![recreate], is_replicated_table).await.unwrap();

        let issue = store.get_issue("td-1").await.unwrap().unwrap();
        assert!(issue.deleted_at.is_none());
        assert_eq!(issue.title, "v2");
    }

    #[tokio::test]
    async fn id_comes_from_the_envelope() {
        let store = Store::open_in_memory().await.unwrap();
        // Payload claims a different id; the envelope wins.
        let mut e = create_issue(1, "td-real", "x");
        e.payload["new_data"]["id"] = Value::String("td-fake".into());
        apply_remote_events(&store, vec![e], is_replicated_table).await.unwrap();
        assert!(store.get_issue("td-real").await.unwrap().is_some());
        assert!(store.get_issue("td-fake").await.unwrap().is_none());
    }
}

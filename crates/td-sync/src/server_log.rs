//! The server-side event log.
//!
//! One SQLite table holds every project's events; `server_seq` is strictly
//! increasing per project and assigned inside the push transaction, so a
//! batch is acknowledged whole or not at all.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::protocol::{Ack, Event, PullResult, PushResult};
use crate::{from_call, SyncError};

const SCHEMA: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA busy_timeout=5000;

    CREATE TABLE IF NOT EXISTS sync_events (
        project_id       TEXT NOT NULL,
        server_seq       INTEGER NOT NULL,
        device_id        TEXT NOT NULL,
        session_id       TEXT NOT NULL DEFAULT '',
        client_action_id INTEGER NOT NULL,
        action_type      TEXT NOT NULL,
        entity_type      TEXT NOT NULL,
        entity_id        TEXT NOT NULL,
        payload          TEXT NOT NULL,
        client_timestamp TEXT NOT NULL,
        server_timestamp TEXT NOT NULL,
        PRIMARY KEY (project_id, server_seq)
    );

    CREATE INDEX IF NOT EXISTS idx_sync_events_device
        ON sync_events(project_id, device_id);
";

/// Append-only, per-project-ordered event storage.
pub struct EventLog {
    conn: Connection,
}

impl EventLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let conn = Connection::open(path.as_ref()).await.map_err(from_call)?;
        let log = Self { conn };
        log.init_schema().await?;
        Ok(log)
    }

    pub async fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().await.map_err(from_call)?;
        let log = Self { conn };
        log.init_schema().await?;
        Ok(log)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Insert a batch, assigning sequences in submission order.
    ///
    /// The whole batch runs in one transaction: `MAX(server_seq)` is read and
    /// extended atomically, so concurrent pushes serialize and every event
    /// gets a unique, monotonic sequence.
    pub async fn push_events(
        &self,
        project_id: &str,
        events: Vec<Event>,
    ) -> Result<PushResult, SyncError> {
        let project = project_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(server_seq), 0) FROM sync_events WHERE project_id = ?1",
                    rusqlite::params![project],
                    |r| r.get(0),
                )?;
                let now = Utc::now();
                let mut acks = Vec::with_capacity(events.len());
                for event in &events {
                    seq += 1;
                    tx.execute(
                        "INSERT INTO sync_events
                            (project_id, server_seq, device_id, session_id, client_action_id,
                             action_type, entity_type, entity_id, payload,
                             client_timestamp, server_timestamp)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                        rusqlite::params![
                            project,
                            seq,
                            event.device_id,
                            event.session_id,
                            event.client_action_id,
                            event.action_type,
                            event.entity_type,
                            event.entity_id,
                            event.payload.to_string(),
                            event.client_timestamp.to_rfc3339(),
                            now.to_rfc3339(),
                        ],
                    )?;
                    acks.push(Ack { client_action_id: event.client_action_id, server_seq: seq });
                }
                tx.commit()?;
                tracing::debug!(project = %project, count = acks.len(), last_seq = seq, "events pushed");
                Ok(PushResult { acks, last_server_seq: seq })
            })
            .await
            .map_err(from_call)
    }

    /// Events with `server_seq > since`, ascending, capped at `limit`.
    ///
    /// The limit window is computed before device exclusion so the returned
    /// `last_server_seq` bounds exactly what was scanned: everything at or
    /// below it is either returned or belongs to the excluded device.
    pub async fn events_since(
        &self,
        project_id: &str,
        since: i64,
        limit: i64,
        exclude_device: Option<&str>,
    ) -> Result<PullResult, SyncError> {
        let project = project_id.to_string();
        let exclude = exclude_device.map(String::from);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT server_seq, device_id, session_id, client_action_id, action_type,
                            entity_type, entity_id, payload, client_timestamp, server_timestamp
                     FROM sync_events
                     WHERE project_id = ?1 AND server_seq > ?2
                     ORDER BY server_seq ASC LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![project, since, limit])?;
                let mut events = Vec::new();
                let mut last = since;
                while let Some(row) = rows.next()? {
                    let event = row_to_event(row)?;
                    last = event.server_seq;
                    let own = exclude
                        .as_deref()
                        .is_some_and(|d| !d.is_empty() && d == event.device_id);
                    if !own {
                        events.push(event);
                    }
                }
                Ok(PullResult { events, last_server_seq: last })
            })
            .await
            .map_err(from_call)
    }

    /// Highest assigned sequence for a project (0 when empty).
    pub async fn max_seq(&self, project_id: &str) -> Result<i64, SyncError> {
        let project = project_id.to_string();
        self.conn
            .call(move |conn| {
                let max: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(server_seq), 0) FROM sync_events WHERE project_id = ?1",
                    rusqlite::params![project],
                    |r| r.get(0),
                )?;
                Ok(max)
            })
            .await
            .map_err(from_call)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload: String = row.get(7)?;
    let client_ts: String = row.get(8)?;
    let server_ts: String = row.get(9)?;
    Ok(Event {
        server_seq: row.get(0)?,
        device_id: row.get(1)?,
        session_id: row.get(2)?,
        client_action_id: row.get(3)?,
        action_type: row.get(4)?,
        entity_type: row.get(5)?,
        entity_id: row.get(6)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        client_timestamp: parse_ts(&client_ts),
        server_timestamp: parse_ts(&server_ts),
    })
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(device: &str, action_id: i64) -> Event {
        Event {
            server_seq: 0,
            device_id: device.into(),
            session_id: "s1".into(),
            client_action_id: action_id,
            action_type: "create".into(),
            entity_type: "issues".into(),
            entity_id: format!("td-{action_id}"),
            payload: serde_json::json!({"schema_version": 1, "new_data": {"id": format!("td-{action_id}")}}),
            client_timestamp: Utc::now(),
            server_timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_project() {
        let log = EventLog::open_in_memory().await.unwrap();

        let first = log.push_events("p1", vec![event("a", 1), event("a", 2)]).await.unwrap();
        assert_eq!(
            first.acks,
            vec![
                Ack { client_action_id: 1, server_seq: 1 },
                Ack { client_action_id: 2, server_seq: 2 }
            ]
        );

        let second = log.push_events("p1", vec![event("b", 1)]).await.unwrap();
        assert_eq!(second.acks[0].server_seq, 3);
        assert_eq!(second.last_server_seq, 3);

        // An independent project starts its own sequence.
        let other = log.push_events("p2", vec![event("a", 1)]).await.unwrap();
        assert_eq!(other.acks[0].server_seq, 1);
    }

    #[tokio::test]
    async fn events_since_orders_and_excludes_device() {
        let log = EventLog::open_in_memory().await.unwrap();
        log.push_events("p1", vec![event("a", 1), event("a", 2)]).await.unwrap();
        log.push_events("p1", vec![event("b", 1)]).await.unwrap();

        let all = log.events_since("p1", 0, 100, None).await.unwrap();
        assert_eq!(all.events.len(), 3);
        assert!(all.events.windows(2).all(|w| w[0].server_seq < w[1].server_seq));
        assert_eq!(all.last_server_seq, 3);

        let without_a = log.events_since("p1", 0, 100, Some("a")).await.unwrap();
        assert_eq!(without_a.events.len(), 1);
        assert_eq!(without_a.events[0].device_id, "b");
        // Watermark still advances over the excluded events.
        assert_eq!(without_a.last_server_seq, 3);
    }

    #[tokio::test]
    async fn limit_caps_the_scan_window() {
        let log = EventLog::open_in_memory().await.unwrap();
        log.push_events("p1", vec![event("a", 1), event("a", 2), event("a", 3)]).await.unwrap();

        let page = log.events_since("p1", 0, 2, None).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.last_server_seq, 2);

        let rest = log.events_since("p1", page.last_server_seq, 2, None).await.unwrap();
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].server_seq, 3);
    }

    #[tokio::test]
    async fn empty_pull_keeps_watermark() {
        let log = EventLog::open_in_memory().await.unwrap();
        let page = log.events_since("p1", 5, 10, None).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.last_server_seq, 5);
    }

    #[tokio::test]
    async fn server_stamps_its_own_timestamp() {
        let log = EventLog::open_in_memory().await.unwrap();
        let mut e = event("a", 1);
        e.client_timestamp = Utc::now() - chrono::Duration::days(2);
        log.push_events("p1", vec![e]).await.unwrap();

        let pulled = log.events_since("p1", 0, 10, None).await.unwrap();
        let event = &pulled.events[0];
        assert!(event.server_timestamp > event.client_timestamp);
    }
}

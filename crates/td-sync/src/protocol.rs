//! Wire types for the push/pull protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use td_store::ActionEntry;

/// Payload schema version understood by this build. Apply rejects anything
/// else with a per-event failure.
pub const PAYLOAD_SCHEMA_VERSION: i64 = 1;

/// Wire verbs. Kept as strings so an unknown verb fails one event instead of
/// the whole pull response.
pub mod verb {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const SOFT_DELETE: &str = "soft_delete";
}

/// The acknowledgment pairing a journal rowid with its assigned sequence.
pub type Ack = td_store::SyncAck;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One replicated mutation.
///
/// `server_seq` and `server_timestamp` are zero/placeholder until the server
/// assigns them at insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub server_seq: i64,
    pub device_id: String,
    pub session_id: String,
    pub client_action_id: i64,
    pub action_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
}

impl Event {
    /// Materialize a journal row as an outbound event: domain verbs collapse
    /// to the wire verb and the payload wraps both JSON images under the
    /// schema version.
    pub fn from_action(entry: &ActionEntry, device_id: &str) -> Event {
        Event {
            server_seq: 0,
            device_id: device_id.to_string(),
            session_id: entry.session_id.clone(),
            client_action_id: entry.rowid,
            action_type: entry.action_type.wire_verb().to_string(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            payload: serde_json::json!({
                "schema_version": PAYLOAD_SCHEMA_VERSION,
                "new_data": entry.new_data,
                "previous_data": entry.previous_data,
            }),
            client_timestamp: entry.timestamp,
            server_timestamp: entry.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Push / pull / apply results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResult {
    pub acks: Vec<Ack>,
    pub last_server_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResult {
    pub events: Vec<Event>,
    /// Highest sequence the server scanned producing this page. Everything
    /// at or below it is either in `events` or was deliberately excluded,
    /// so the client may advance its watermark here.
    pub last_server_seq: i64,
}

/// One isolated apply failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyFailure {
    pub server_seq: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplyResult {
    pub applied: usize,
    pub failed: Vec<ApplyFailure>,
    /// Highest sequence seen, applied or not; the watermark advances here so
    /// failing events are not re-pulled.
    pub last_applied_seq: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use td_store::ActionType;

    fn entry(action_type: ActionType) -> ActionEntry {
        ActionEntry {
            rowid: 7,
            id: "a1".into(),
            session_id: "s1".into(),
            action_type,
            entity_type: "issues".into(),
            entity_id: "td-1".into(),
            previous_data: None,
            new_data: Some(serde_json::json!({"id": "td-1", "title": "x"})),
            timestamp: Utc::now(),
            undone: false,
            synced_at: None,
            server_seq: None,
        }
    }

    #[test]
    fn from_action_wraps_payload() {
        let event = Event::from_action(&entry(ActionType::Create), "dev-a");
        assert_eq!(event.action_type, verb::CREATE);
        assert_eq!(event.client_action_id, 7);
        assert_eq!(event.payload["schema_version"], PAYLOAD_SCHEMA_VERSION);
        assert_eq!(event.payload["new_data"]["title"], "x");
        assert!(event.payload["previous_data"].is_null());
    }

    #[test]
    fn domain_verbs_export_as_update() {
        let event = Event::from_action(&entry(ActionType::Approve), "dev-a");
        assert_eq!(event.action_type, verb::UPDATE);
    }

    #[test]
    fn event_json_shape() {
        let event = Event::from_action(&entry(ActionType::Create), "dev-a");
        let json = serde_json::to_value(&event).unwrap();
        for key in [
            "server_seq",
            "device_id",
            "session_id",
            "client_action_id",
            "action_type",
            "entity_type",
            "entity_id",
            "payload",
            "client_timestamp",
            "server_timestamp",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}

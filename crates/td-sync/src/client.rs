//! The client side of the sync cycle: push pending journal rows, pull and
//! apply remote events, maintain the per-project watermarks.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use td_store::{is_replicated_table, Store};

use crate::apply::apply_remote_events;
use crate::protocol::{ApplyFailure, Event};
use crate::transport::SyncTransport;
use crate::SyncError;

/// Default pull page size.
pub const DEFAULT_PULL_LIMIT: i64 = 500;

/// Outcome of one sync cycle (or one half of it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSummary {
    pub pushed: usize,
    pub pulled: usize,
    pub applied: usize,
    pub failed: Vec<ApplyFailure>,
    pub last_server_seq: i64,
}

/// A device-scoped handle over a transport.
pub struct SyncClient<T> {
    transport: T,
    project_id: String,
    device_id: String,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(transport: T, project_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            transport,
            project_id: project_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Push every pending journal row, in rowid order, as one atomic batch.
    /// Acks are recorded before the watermarks move.
    pub async fn push(&self, store: &Store) -> Result<SyncSummary, SyncError> {
        let mut state = store.sync_state(&self.project_id).await?;
        if state.sync_disabled {
            return Err(SyncError::Disabled(self.project_id.clone()));
        }

        let pending = store.pending_actions().await?;
        if pending.is_empty() {
            return Ok(SyncSummary::default());
        }
        let events: Vec<Event> = pending
            .iter()
            .map(|entry| Event::from_action(entry, &self.device_id))
            .collect();
        let count = events.len();

        let result = self.transport.push(&self.project_id, events).await?;
        store.mark_events_synced(result.acks.clone()).await?;

        state.last_pushed_action_id = result
            .acks
            .iter()
            .map(|a| a.client_action_id)
            .max()
            .unwrap_or(state.last_pushed_action_id);
        state.last_sync_at = Some(Utc::now());
        store.save_sync_state(&state).await?;

        tracing::info!(
            project = %self.project_id,
            pushed = count,
            last_seq = result.last_server_seq,
            "push complete"
        );
        Ok(SyncSummary {
            pushed: count,
            last_server_seq: result.last_server_seq,
            ..Default::default()
        })
    }

    /// Pull events past the watermark and apply them in sequence order.
    /// `exclude_self` filters out this device's own events (the normal
    /// cycle).
    pub async fn pull(
        &self,
        store: &Store,
        exclude_self: bool,
        limit: i64,
    ) -> Result<SyncSummary, SyncError> {
        let mut state = store.sync_state(&self.project_id).await?;
        if state.sync_disabled {
            return Err(SyncError::Disabled(self.project_id.clone()));
        }

        let exclude = if exclude_self { Some(self.device_id.as_str()) } else { None };
        let result = self
            .transport
            .pull(&self.project_id, state.last_pulled_server_seq, limit, exclude)
            .await?;
        let pulled = result.events.len();

        let apply = apply_remote_events(store, result.events, is_replicated_table).await?;

        state.last_pulled_server_seq = state
            .last_pulled_server_seq
            .max(apply.last_applied_seq)
            .max(result.last_server_seq);
        state.last_sync_at = Some(Utc::now());
        store.save_sync_state(&state).await?;

        tracing::info!(
            project = %self.project_id,
            pulled,
            applied = apply.applied,
            failed = apply.failed.len(),
            watermark = state.last_pulled_server_seq,
            "pull complete"
        );
        Ok(SyncSummary {
            pulled,
            applied: apply.applied,
            failed: apply.failed,
            last_server_seq: state.last_pulled_server_seq,
            ..Default::default()
        })
    }

    /// The full cycle: push, then pull pages (excluding our own events)
    /// until the watermark stops advancing.
    pub async fn sync_once(&self, store: &Store) -> Result<SyncSummary, SyncError> {
        let push = self.push(store).await?;
        let mut summary = SyncSummary { pushed: push.pushed, ..Default::default() };
        let mut watermark = store.sync_state(&self.project_id).await?.last_pulled_server_seq;
        loop {
            let page = self.pull(store, true, DEFAULT_PULL_LIMIT).await?;
            summary.pulled += page.pulled;
            summary.applied += page.applied;
            summary.failed.extend(page.failed);
            summary.last_server_seq = page.last_server_seq;
            if page.last_server_seq <= watermark {
                break;
            }
            watermark = page.last_server_seq;
        }
        summary.last_server_seq = summary.last_server_seq.max(push.last_server_seq);
        Ok(summary)
    }

    /// Verification pull: re-read the log from the beginning with no device
    /// exclusion. Application is idempotent, so this converges the local
    /// tables onto the full event history.
    pub async fn pull_all(&self, store: &Store) -> Result<SyncSummary, SyncError> {
        let mut since = 0i64;
        let mut summary = SyncSummary::default();
        loop {
            let result = self
                .transport
                .pull(&self.project_id, since, DEFAULT_PULL_LIMIT, None)
                .await?;
            if result.events.is_empty() && result.last_server_seq <= since {
                break;
            }
            summary.pulled += result.events.len();
            let apply = apply_remote_events(store, result.events, is_replicated_table).await?;
            summary.applied += apply.applied;
            summary.failed.extend(apply.failed);
            since = result.last_server_seq;
            summary.last_server_seq = since;
        }

        let mut state = store.sync_state(&self.project_id).await?;
        state.last_pulled_server_seq = state.last_pulled_server_seq.max(summary.last_server_seq);
        state.last_sync_at = Some(Utc::now());
        store.save_sync_state(&state).await?;
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

/// Stable per-checkout device id, created on first use and persisted at
/// `.todos/device-id`.
pub fn device_id(project_dir: &Path) -> std::io::Result<String> {
    let path = project_dir.join(td_core::DATA_DIR).join("device-id");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &id)?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use td_core::types::Issue;
    use td_store::ActionType;

    use crate::server_log::EventLog;
    use crate::transport::LocalTransport;

    async fn client(log: &Arc<EventLog>, device: &str) -> SyncClient<LocalTransport> {
        SyncClient::new(LocalTransport::new(log.clone()), "p1", device)
    }

    #[tokio::test]
    async fn push_acks_mark_journal_rows() {
        let log = Arc::new(EventLog::open_in_memory().await.unwrap());
        let store = Store::open_in_memory().await.unwrap();
        let a = client(&log, "dev-a").await;

        store.create_issue_logged(&Issue::new("td-1", "x", "s1"), "s1").await.unwrap();
        let summary = a.push(&store).await.unwrap();
        assert_eq!(summary.pushed, 1);
        assert_eq!(summary.last_server_seq, 1);

        // Nothing left to push; the journal row carries its seq.
        assert_eq!(a.push(&store).await.unwrap().pushed, 0);
        let state = store.sync_state("p1").await.unwrap();
        assert_eq!(state.last_pushed_action_id, 1);
    }

    #[tokio::test]
    async fn pull_excludes_own_device() {
        let log = Arc::new(EventLog::open_in_memory().await.unwrap());
        let store_a = Store::open_in_memory().await.unwrap();
        let store_b = Store::open_in_memory().await.unwrap();
        let a = client(&log, "dev-a").await;
        let b = client(&log, "dev-b").await;

        store_a.create_issue_logged(&Issue::new("td-1", "x", "s1"), "s1").await.unwrap();
        a.push(&store_a).await.unwrap();

        // A's own pull sees nothing but still advances its watermark.
        let own = a.pull(&store_a, true, 100).await.unwrap();
        assert_eq!(own.pulled, 0);
        assert_eq!(own.last_server_seq, 1);

        // B receives the event.
        let theirs = b.pull(&store_b, true, 100).await.unwrap();
        assert_eq!(theirs.pulled, 1);
        assert_eq!(theirs.applied, 1);
        assert!(store_b.get_issue("td-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_disabled_is_an_error() {
        let log = Arc::new(EventLog::open_in_memory().await.unwrap());
        let store = Store::open_in_memory().await.unwrap();
        let a = client(&log, "dev-a").await;

        let mut state = store.sync_state("p1").await.unwrap();
        state.sync_disabled = true;
        store.save_sync_state(&state).await.unwrap();

        assert!(matches!(a.push(&store).await, Err(SyncError::Disabled(_))));
        assert!(matches!(a.pull(&store, true, 10).await, Err(SyncError::Disabled(_))));
    }

    #[tokio::test]
    async fn sync_once_round_trip() {
        let log = Arc::new(EventLog::open_in_memory().await.unwrap());
        let store_a = Store::open_in_memory().await.unwrap();
        let store_b = Store::open_in_memory().await.unwrap();
        let a = client(&log, "dev-a").await;
        let b = client(&log, "dev-b").await;

        store_a.create_issue_logged(&Issue::new("td-1", "x", "s1"), "s1").await.unwrap();
        a.sync_once(&store_a).await.unwrap();
        b.sync_once(&store_b).await.unwrap();

        // B transitions the issue; both converge after the next cycles.
        let mut issue = store_b.get_issue("td-1").await.unwrap().unwrap();
        issue.status = td_core::types::IssueStatus::InProgress;
        store_b.update_issue_logged(&issue, "s2", ActionType::Start).await.unwrap();
        b.sync_once(&store_b).await.unwrap();
        a.sync_once(&store_a).await.unwrap();

        let on_a = store_a.get_issue("td-1").await.unwrap().unwrap();
        assert_eq!(on_a.status, td_core::types::IssueStatus::InProgress);
    }

    #[tokio::test]
    async fn device_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = device_id(dir.path()).unwrap();
        let second = device_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }
}

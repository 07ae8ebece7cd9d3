//! Issue CRUD and the canonical logged-mutation entry points.

use chrono::Utc;
use serde_json::Value;

use td_core::review::{evaluate_approve_eligibility, ReviewableByOptions};
use td_core::types::{Issue, IssueStatus, IssueType, Priority};

use crate::action_log::{log_action_tx, ActionType};
use crate::error::{from_call, StoreError};
use crate::query::IssueFilter;
use crate::store::{parse_ts, parse_ts_opt, Store};

// ---------------------------------------------------------------------------
// Record <-> row mapping
// ---------------------------------------------------------------------------

/// Full column image of an issue as a JSON object. This is what lands in
/// action_log payloads, so keys must match column names and values must be
/// SQLite-bindable scalars (labels are a JSON-encoded string, minor an int).
pub(crate) fn issue_record(issue: &Issue) -> Value {
    serde_json::json!({
        "id": issue.id,
        "title": issue.title,
        "description": issue.description,
        "status": issue.status.as_str(),
        "issue_type": issue.issue_type.as_str(),
        "priority": issue.priority.as_str(),
        "points": issue.points,
        "labels": serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".into()),
        "parent_id": issue.parent_id,
        "acceptance": issue.acceptance,
        "creator_session": issue.creator_session,
        "implementer_session": issue.implementer_session,
        "reviewer_session": issue.reviewer_session,
        "created_at": issue.created_at.to_rfc3339(),
        "updated_at": issue.updated_at.to_rfc3339(),
        "closed_at": issue.closed_at.map(|t| t.to_rfc3339()),
        "deleted_at": issue.deleted_at.map(|t| t.to_rfc3339()),
        "due_date": issue.due_date.map(|t| t.to_rfc3339()),
        "defer_until": issue.defer_until.map(|t| t.to_rfc3339()),
        "defer_count": issue.defer_count,
        "minor": issue.minor as i64,
        "created_branch": issue.created_branch,
    })
}

const ISSUE_COLUMNS: &str = "id, title, description, status, issue_type, priority, points,
     labels, parent_id, acceptance, creator_session, implementer_session, reviewer_session,
     created_at, updated_at, closed_at, deleted_at, due_date, defer_until, defer_count,
     minor, created_branch";

pub(crate) fn row_to_issue(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issue> {
    let status: String = row.get(3)?;
    let issue_type: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let labels: String = row.get(7)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(Issue {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: IssueStatus::parse(&status).unwrap_or(IssueStatus::Open),
        issue_type: IssueType::parse(&issue_type).unwrap_or(IssueType::Task),
        priority: Priority::parse(&priority).unwrap_or(Priority::P2),
        points: row.get(6)?,
        labels: serde_json::from_str(&labels).unwrap_or_default(),
        parent_id: row.get(8)?,
        acceptance: row.get(9)?,
        creator_session: row.get(10)?,
        implementer_session: row.get(11)?,
        reviewer_session: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        closed_at: parse_ts_opt(row.get(15)?),
        deleted_at: parse_ts_opt(row.get(16)?),
        due_date: parse_ts_opt(row.get(17)?),
        defer_until: parse_ts_opt(row.get(18)?),
        defer_count: row.get(19)?,
        minor: row.get::<_, i64>(20)? != 0,
        created_branch: row.get(21)?,
    })
}

fn write_issue_row(conn: &rusqlite::Connection, issue: &Issue) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO issues ({ISSUE_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)"
        ),
        rusqlite::params![
            issue.id,
            issue.title,
            issue.description,
            issue.status.as_str(),
            issue.issue_type.as_str(),
            issue.priority.as_str(),
            issue.points,
            serde_json::to_string(&issue.labels).unwrap_or_else(|_| "[]".into()),
            issue.parent_id,
            issue.acceptance,
            issue.creator_session,
            issue.implementer_session,
            issue.reviewer_session,
            issue.created_at.to_rfc3339(),
            issue.updated_at.to_rfc3339(),
            issue.closed_at.map(|t| t.to_rfc3339()),
            issue.deleted_at.map(|t| t.to_rfc3339()),
            issue.due_date.map(|t| t.to_rfc3339()),
            issue.defer_until.map(|t| t.to_rfc3339()),
            issue.defer_count,
            issue.minor as i64,
            issue.created_branch,
        ],
    )?;
    Ok(())
}

fn load_issue(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Issue>> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
        rusqlite::params![id],
        row_to_issue,
    )
    .optional()
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

impl Store {
    /// Allocate the next `td-N` issue id.
    pub async fn next_issue_id(&self) -> Result<String, StoreError> {
        self.connection()
            .call(|conn| {
                let max: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(CAST(substr(id, 4) AS INTEGER)), 0)
                     FROM issues WHERE id LIKE 'td-%'",
                    [],
                    |r| r.get(0),
                )?;
                Ok(format!("td-{}", max + 1))
            })
            .await
            .map_err(from_call)
    }

    pub async fn get_issue(&self, id: &str) -> Result<Option<Issue>, StoreError> {
        let id = id.to_string();
        self.connection()
            .call(move |conn| Ok(load_issue(conn, &id)?))
            .await
            .map_err(from_call)
    }

    /// Insert a new issue and its `create` journal row in one transaction.
    pub async fn create_issue_logged(
        &self,
        issue: &Issue,
        session_id: &str,
    ) -> Result<(), StoreError> {
        if issue.id.trim().is_empty() {
            return Err(StoreError::Invalid("issue id must not be empty".into()));
        }
        let issue = issue.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                if load_issue(&tx, &issue.id)?.is_some() {
                    return Err(StoreError::Invalid(format!("issue {} already exists", issue.id)).into());
                }
                write_issue_row(&tx, &issue)?;
                log_action_tx(
                    &tx,
                    &session,
                    ActionType::Create,
                    "issues",
                    &issue.id,
                    None,
                    Some(&issue_record(&issue)),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// The canonical mutation entry point: re-reads the pre-image, stamps
    /// `updated_at`, writes the row and the journal entry in one
    /// transaction. Returns the stored issue.
    pub async fn update_issue_logged(
        &self,
        issue: &Issue,
        session_id: &str,
        action_type: ActionType,
    ) -> Result<Issue, StoreError> {
        let mut issue = issue.clone();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous = load_issue(&tx, &issue.id)?.ok_or_else(|| {
                    StoreError::NotFound { entity: "issue", id: issue.id.clone() }
                })?;
                issue.updated_at = Utc::now();
                write_issue_row(&tx, &issue)?;
                log_action_tx(
                    &tx,
                    &session,
                    action_type,
                    "issues",
                    &issue.id,
                    Some(&issue_record(&previous)),
                    Some(&issue_record(&issue)),
                )?;
                tx.commit()?;
                Ok(issue)
            })
            .await
            .map_err(from_call)
    }

    /// Soft delete: the row stays, `deleted_at` is set, and the journal
    /// records a `soft_delete` that replicates.
    pub async fn soft_delete_issue_logged(
        &self,
        id: &str,
        session_id: &str,
    ) -> Result<Issue, StoreError> {
        let id = id.to_string();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous = load_issue(&tx, &id)?
                    .ok_or_else(|| StoreError::NotFound { entity: "issue", id: id.clone() })?;
                let mut issue = previous.clone();
                let now = Utc::now();
                issue.deleted_at = Some(now);
                issue.updated_at = now;
                write_issue_row(&tx, &issue)?;
                log_action_tx(
                    &tx,
                    &session,
                    ActionType::SoftDelete,
                    "issues",
                    &id,
                    Some(&issue_record(&previous)),
                    Some(&issue_record(&issue)),
                )?;
                tx.commit()?;
                Ok(issue)
            })
            .await
            .map_err(from_call)
    }

    /// Hard delete: the row is removed and a `delete` journal entry keeps
    /// the pre-image for undo.
    pub async fn delete_issue_logged(&self, id: &str, session_id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let previous = load_issue(&tx, &id)?
                    .ok_or_else(|| StoreError::NotFound { entity: "issue", id: id.clone() })?;
                tx.execute("DELETE FROM issues WHERE id = ?1", rusqlite::params![id])?;
                log_action_tx(
                    &tx,
                    &session,
                    ActionType::Delete,
                    "issues",
                    &id,
                    Some(&issue_record(&previous)),
                    None,
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_call)
    }

    /// Structured listing over the filter DSL.
    pub async fn list_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>, StoreError> {
        let (clauses, params) = filter.to_sql();
        self.connection()
            .call(move |conn| {
                let mut sql = format!("SELECT {ISSUE_COLUMNS} FROM issues");
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY priority ASC, created_at ASC");
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_issue(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    /// Issues in review that `session_id` is eligible to approve, under the
    /// same policy as `evaluate_approve_eligibility`.
    pub async fn reviewable_by(
        &self,
        session_id: &str,
        opts: ReviewableByOptions,
    ) -> Result<Vec<Issue>, StoreError> {
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ISSUE_COLUMNS} FROM issues
                     WHERE status = 'in_review' AND deleted_at IS NULL
                     ORDER BY priority ASC, created_at ASC"
                ))?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let issue = row_to_issue(row)?;
                    let (involved, impl_involved) =
                        session_involvement(conn, &issue.id, &session)?;
                    let eligibility = evaluate_approve_eligibility(
                        Some(&issue),
                        &session,
                        involved,
                        impl_involved,
                        opts.balanced,
                    );
                    if eligibility.allowed {
                        out.push(issue);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(from_call)
    }

    /// Involvement inputs for the approval policy, derived from recorded
    /// activity on the issue.
    pub async fn session_involvement(
        &self,
        issue_id: &str,
        session_id: &str,
    ) -> Result<(bool, bool), StoreError> {
        let issue = issue_id.to_string();
        let session = session_id.to_string();
        self.connection()
            .call(move |conn| Ok(session_involvement(conn, &issue, &session)?))
            .await
            .map_err(from_call)
    }
}

/// `(was_involved, was_implementation_involved)` for a session on an issue.
///
/// Any log, comment, or handoff counts as involvement. Implementation
/// involvement is logs of the working types (progress, tried, result).
fn session_involvement(
    conn: &rusqlite::Connection,
    issue_id: &str,
    session_id: &str,
) -> rusqlite::Result<(bool, bool)> {
    let involved: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM logs WHERE issue_id = ?1 AND session_id = ?2)
             OR EXISTS(SELECT 1 FROM comments WHERE issue_id = ?1 AND session_id = ?2)
             OR EXISTS(SELECT 1 FROM handoffs WHERE issue_id = ?1 AND session_id = ?2)",
        rusqlite::params![issue_id, session_id],
        |r| r.get(0),
    )?;
    let impl_involved: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM logs
             WHERE issue_id = ?1 AND session_id = ?2
               AND log_type IN ('progress', 'tried', 'result'))",
        rusqlite::params![issue_id, session_id],
        |r| r.get(0),
    )?;
    Ok((involved, impl_involved))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use td_core::types::{LogEntry, LogType};

    async fn store_with_issue(id: &str, session: &str) -> (Store, Issue) {
        let store = Store::open_in_memory().await.unwrap();
        let issue = Issue::new(id, "test issue", session);
        store.create_issue_logged(&issue, session).await.unwrap();
        (store, issue)
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (store, issue) = store_with_issue("td-1", "s1").await;
        let loaded = store.get_issue("td-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, issue.id);
        assert_eq!(loaded.title, "test issue");
        assert_eq!(loaded.status, IssueStatus::Open);
        assert_eq!(loaded.creator_session, "s1");
    }

    #[tokio::test]
    async fn create_writes_exactly_one_journal_row() {
        let (store, _) = store_with_issue("td-1", "s1").await;
        let pending = store.pending_actions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Create);
        assert_eq!(pending[0].entity_type, "issues");
        assert_eq!(pending[0].entity_id, "td-1");
        assert!(pending[0].previous_data.is_none());
        let new_data = pending[0].new_data.as_ref().unwrap();
        assert_eq!(new_data["title"], "test issue");
    }

    #[tokio::test]
    async fn duplicate_create_rejected_without_journal_row() {
        let (store, issue) = store_with_issue("td-1", "s1").await;
        let err = store.create_issue_logged(&issue, "s1").await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        // The failed transaction left no journal row behind.
        assert_eq!(store.pending_actions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_logged_diffs_pre_image() {
        let (store, mut issue) = store_with_issue("td-1", "s1").await;
        issue.status = IssueStatus::InProgress;
        issue.implementer_session = Some("s2".into());
        let updated = store
            .update_issue_logged(&issue, "s2", ActionType::Start)
            .await
            .unwrap();
        assert!(updated.updated_at >= updated.created_at);

        let pending = store.pending_actions().await.unwrap();
        assert_eq!(pending.len(), 2);
        let action = &pending[1];
        assert_eq!(action.action_type, ActionType::Start);
        let prev = action.previous_data.as_ref().unwrap();
        let new = action.new_data.as_ref().unwrap();
        assert_eq!(prev["status"], "open");
        assert_eq!(new["status"], "in_progress");
        assert_eq!(new["implementer_session"], "s2");
    }

    #[tokio::test]
    async fn update_missing_issue_leaves_no_journal_row() {
        let store = Store::open_in_memory().await.unwrap();
        let ghost = Issue::new("td-9", "ghost", "s1");
        let err = store
            .update_issue_logged(&ghost, "s1", ActionType::Update)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.pending_actions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn soft_delete_hides_from_default_listing() {
        let (store, _) = store_with_issue("td-1", "s1").await;
        store.soft_delete_issue_logged("td-1", "s1").await.unwrap();

        let visible = store.list_issues(&IssueFilter::default()).await.unwrap();
        assert!(visible.is_empty());

        let all = store
            .list_issues(&IssueFilter { include_deleted: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_deleted());
    }

    #[tokio::test]
    async fn hard_delete_removes_row_and_keeps_pre_image() {
        let (store, _) = store_with_issue("td-1", "s1").await;
        store.delete_issue_logged("td-1", "s1").await.unwrap();
        assert!(store.get_issue("td-1").await.unwrap().is_none());

        let pending = store.pending_actions().await.unwrap();
        let action = pending.last().unwrap();
        assert_eq!(action.action_type, ActionType::Delete);
        assert!(action.new_data.is_none());
        assert_eq!(action.previous_data.as_ref().unwrap()["id"], "td-1");
    }

    #[tokio::test]
    async fn next_issue_id_increments() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.next_issue_id().await.unwrap(), "td-1");
        store
            .create_issue_logged(&Issue::new("td-7", "x", "s1"), "s1")
            .await
            .unwrap();
        assert_eq!(store.next_issue_id().await.unwrap(), "td-8");
    }

    #[tokio::test]
    async fn reviewable_by_applies_balanced_policy() {
        let store = Store::open_in_memory().await.unwrap();

        // Created by s1, implemented by s2, now in review.
        let mut issue = Issue::new("td-1", "x", "s1");
        store.create_issue_logged(&issue, "s1").await.unwrap();
        issue.status = IssueStatus::InReview;
        issue.implementer_session = Some("s2".into());
        store
            .update_issue_logged(&issue, "s2", ActionType::Review)
            .await
            .unwrap();
        // Record implementation activity for s2.
        let mut log = LogEntry::new("l1", "s2", "did the work", LogType::Progress);
        log.issue_id = Some("td-1".into());
        store.create_log_logged(&log, "s2").await.unwrap();

        let balanced = ReviewableByOptions { balanced: true };
        // Implementer cannot approve.
        assert!(store.reviewable_by("s2", balanced).await.unwrap().is_empty());
        // Creator may (creator exception).
        assert_eq!(store.reviewable_by("s1", balanced).await.unwrap().len(), 1);
        // An uninvolved outsider may.
        assert_eq!(store.reviewable_by("s3", balanced).await.unwrap().len(), 1);
        // Under strict policy the creator may not.
        let strict = ReviewableByOptions { balanced: false };
        assert!(store.reviewable_by("s1", strict).await.unwrap().is_empty());
    }
}

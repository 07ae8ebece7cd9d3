use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// IssueStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    InReview,
    Closed,
}

impl IssueStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// The graph is acyclic except for the `closed -> open` reopen edge.
    pub fn can_transition_to(&self, target: &IssueStatus) -> bool {
        matches!(
            (self, target),
            (IssueStatus::Open, IssueStatus::InProgress)
                | (IssueStatus::Open, IssueStatus::Blocked)
                | (IssueStatus::Open, IssueStatus::InReview)
                | (IssueStatus::Open, IssueStatus::Closed)
                | (IssueStatus::InProgress, IssueStatus::InReview)
                | (IssueStatus::InProgress, IssueStatus::Blocked)
                | (IssueStatus::InProgress, IssueStatus::Closed)
                | (IssueStatus::InProgress, IssueStatus::Open)
                | (IssueStatus::Blocked, IssueStatus::Open)
                | (IssueStatus::Blocked, IssueStatus::InProgress)
                | (IssueStatus::Blocked, IssueStatus::Closed)
                | (IssueStatus::InReview, IssueStatus::Closed)
                | (IssueStatus::InReview, IssueStatus::InProgress)
                | (IssueStatus::InReview, IssueStatus::Open)
                | (IssueStatus::Closed, IssueStatus::Open)
        )
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> &'static [IssueStatus] {
        &[
            IssueStatus::Open,
            IssueStatus::InProgress,
            IssueStatus::Blocked,
            IssueStatus::InReview,
            IssueStatus::Closed,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::InReview => "in_review",
            IssueStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<IssueStatus> {
        match s {
            "open" => Some(IssueStatus::Open),
            "in_progress" => Some(IssueStatus::InProgress),
            "blocked" => Some(IssueStatus::Blocked),
            "in_review" => Some(IssueStatus::InReview),
            "closed" => Some(IssueStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// IssueType / Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Bug => "bug",
            IssueType::Feature => "feature",
            IssueType::Task => "task",
            IssueType::Epic => "epic",
            IssueType::Chore => "chore",
        }
    }

    pub fn parse(s: &str) -> Option<IssueType> {
        match s {
            "bug" => Some(IssueType::Bug),
            "feature" => Some(IssueType::Feature),
            "task" => Some(IssueType::Task),
            "epic" => Some(IssueType::Epic),
            "chore" => Some(IssueType::Chore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "p0",
            Priority::P1 => "p1",
            Priority::P2 => "p2",
            Priority::P3 => "p3",
            Priority::P4 => "p4",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s.to_ascii_lowercase().as_str() {
            "p0" => Some(Priority::P0),
            "p1" => Some(Priority::P1),
            "p2" => Some(Priority::P2),
            "p3" => Some(Priority::P3),
            "p4" => Some(Priority::P4),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: IssueStatus,
    pub issue_type: IssueType,
    pub priority: Priority,
    pub points: i64,
    /// Label set; order is not significant.
    pub labels: Vec<String>,
    pub parent_id: Option<String>,
    pub acceptance: Option<String>,
    pub creator_session: String,
    pub implementer_session: Option<String>,
    pub reviewer_session: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub defer_until: Option<DateTime<Utc>>,
    pub defer_count: i64,
    /// Minor issues bypass review-policy checks entirely.
    pub minor: bool,
    pub created_branch: Option<String>,
}

impl Issue {
    pub fn new(id: impl Into<String>, title: impl Into<String>, creator_session: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            status: IssueStatus::Open,
            issue_type: IssueType::Task,
            priority: Priority::P2,
            points: 0,
            labels: Vec::new(),
            parent_id: None,
            acceptance: None,
            creator_session: creator_session.into(),
            implementer_session: None,
            reviewer_session: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            deleted_at: None,
            due_date: None,
            defer_until: None,
            defer_count: 0,
            minor: false,
            created_branch: None,
        }
    }

    /// Returns `true` when the issue is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Add a label if not already present (set semantics).
    pub fn add_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        if !self.labels.iter().any(|l| l == &label) {
            self.labels.push(label);
        }
    }
}

// ---------------------------------------------------------------------------
// LogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Progress,
    Decision,
    Blocker,
    Hypothesis,
    Tried,
    Result,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Progress => "progress",
            LogType::Decision => "decision",
            LogType::Blocker => "blocker",
            LogType::Hypothesis => "hypothesis",
            LogType::Tried => "tried",
            LogType::Result => "result",
        }
    }

    pub fn parse(s: &str) -> Option<LogType> {
        match s {
            "progress" => Some(LogType::Progress),
            "decision" => Some(LogType::Decision),
            "blocker" => Some(LogType::Blocker),
            "hypothesis" => Some(LogType::Hypothesis),
            "tried" => Some(LogType::Tried),
            "result" => Some(LogType::Result),
            _ => None,
        }
    }
}

/// A freeform log line, attached to an issue or standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub issue_id: Option<String>,
    pub session_id: String,
    pub work_session_id: Option<String>,
    pub message: String,
    pub log_type: LogType,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        message: impl Into<String>,
        log_type: LogType,
    ) -> Self {
        Self {
            id: id.into(),
            issue_id: None,
            session_id: session_id.into(),
            work_session_id: None,
            message: message.into(),
            log_type,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handoff
// ---------------------------------------------------------------------------

/// Structured state summary emitted when work moves between sessions.
///
/// Multiple handoffs per issue are allowed; the latest by timestamp is the
/// effective one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub issue_id: String,
    pub session_id: String,
    pub done: Vec<String>,
    pub remaining: Vec<String>,
    pub decisions: Vec<String>,
    pub uncertain: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Handoff {
    pub fn new(id: impl Into<String>, issue_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            issue_id: issue_id.into(),
            session_id: session_id.into(),
            done: Vec::new(),
            remaining: Vec::new(),
            decisions: Vec::new(),
            uncertain: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub issue_id: String,
    pub session_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Dependency
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    Blocks,
    DependsOn,
}

impl DepKind {
    /// The inverse edge semantic.
    pub fn inverse(&self) -> DepKind {
        match self {
            DepKind::Blocks => DepKind::DependsOn,
            DepKind::DependsOn => DepKind::Blocks,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DepKind::Blocks => "blocks",
            DepKind::DependsOn => "depends_on",
        }
    }
}

/// A directed dependency edge between two issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub from_issue: String,
    pub to_issue: String,
    pub kind: DepKind,
}

// ---------------------------------------------------------------------------
// Board / BoardPosition
// ---------------------------------------------------------------------------

/// A saved view over issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    pub query: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ordered placement of an issue within a board. Positions are sparse i64
/// values so an issue can be inserted between two others without renumbering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardPosition {
    pub board_id: String,
    pub issue_id: String,
    pub position: i64,
}

/// Gap between consecutive default board positions.
pub const BOARD_POSITION_GAP: i64 = 65_536;

// ---------------------------------------------------------------------------
// WorkSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSession {
    pub id: String,
    pub name: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub start_sha: Option<String>,
    pub end_sha: Option<String>,
}

impl WorkSession {
    pub fn new(id: impl Into<String>, name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            start_sha: None,
            end_sha: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GitSnapshot / IssueFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitEvent {
    Start,
    Review,
    Close,
}

/// Point-in-time git state captured at a workflow boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitSnapshot {
    pub issue_id: String,
    pub event: GitEvent,
    pub commit_sha: String,
    pub branch: String,
    pub dirty_files: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    Implementation,
    Test,
    Reference,
    Config,
}

impl FileRole {
    pub fn parse(s: &str) -> Option<FileRole> {
        match s {
            "implementation" => Some(FileRole::Implementation),
            "test" => Some(FileRole::Test),
            "reference" => Some(FileRole::Reference),
            "config" => Some(FileRole::Config),
            _ => None,
        }
    }
}

/// A file linked to an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueFile {
    pub issue_id: String,
    pub file_path: String,
    pub role: FileRole,
    pub linked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SecurityEvent
// ---------------------------------------------------------------------------

/// Audit record for review-policy bypasses. Appended to a local JSONL file
/// and never replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub issue_id: String,
    pub session_id: String,
    pub agent_type: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// StatusCounts
// ---------------------------------------------------------------------------

/// Per-status roll-up for the `status` command and the HTTP status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub open: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub in_review: u64,
    pub closed: u64,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        use IssueStatus::*;
        let valid = [
            (Open, InProgress),
            (Open, Blocked),
            (Open, InReview),
            (Open, Closed),
            (InProgress, InReview),
            (InProgress, Blocked),
            (InProgress, Closed),
            (InProgress, Open),
            (Blocked, Open),
            (Blocked, InProgress),
            (Blocked, Closed),
            (InReview, Closed),
            (InReview, InProgress),
            (InReview, Open),
            (Closed, Open),
        ];
        for from in IssueStatus::all() {
            for to in IssueStatus::all() {
                let expected = valid.contains(&(*from, *to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn blocked_cannot_go_straight_to_review() {
        assert!(!IssueStatus::Blocked.can_transition_to(&IssueStatus::InReview));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in IssueStatus::all() {
            assert_eq!(IssueStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(IssueStatus::parse("bogus"), None);
    }

    #[test]
    fn new_issue_defaults() {
        let issue = Issue::new("td-1", "Fix the parser", "sess-a");
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.priority, Priority::P2);
        assert_eq!(issue.points, 0);
        assert!(!issue.minor);
        assert!(!issue.is_deleted());
        assert_eq!(issue.created_at, issue.updated_at);
    }

    #[test]
    fn labels_behave_as_a_set() {
        let mut issue = Issue::new("td-1", "x", "s");
        issue.add_label("backend");
        issue.add_label("backend");
        issue.add_label("urgent");
        assert_eq!(issue.labels, vec!["backend", "urgent"]);
    }

    #[test]
    fn dep_kind_inverse_round_trips() {
        assert_eq!(DepKind::Blocks.inverse(), DepKind::DependsOn);
        assert_eq!(DepKind::DependsOn.inverse().inverse(), DepKind::DependsOn);
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse("P0"), Some(Priority::P0));
        assert_eq!(Priority::parse("p4"), Some(Priority::P4));
        assert_eq!(Priority::parse("p5"), None);
        assert!(Priority::P0 < Priority::P4);
    }
}
